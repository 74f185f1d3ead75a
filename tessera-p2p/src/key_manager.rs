use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use libp2p::{identity, PeerId};

/// Loads the libp2p identity at `path`, creating an Ed25519 one when the
/// file does not exist yet.
pub fn load_or_generate_keypair(path: &Path) -> io::Result<identity::Keypair> {
    if path.exists() {
        let mut file = fs::File::open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        identity::Keypair::from_protobuf_encoding(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    } else {
        let keypair = identity::Keypair::generate_ed25519();
        let bytes = keypair
            .to_protobuf_encoding()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(path)?;
        file.write_all(&bytes)?;
        Ok(keypair)
    }
}

pub fn peer_id(path: &Path) -> io::Result<PeerId> {
    load_or_generate_keypair(path).map(|k| k.public().to_peer_id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys/node.key");
        let first = peer_id(&path).unwrap();
        assert!(path.exists());
        let second = peer_id(&path).unwrap();
        assert_eq!(first, second);
    }
}
