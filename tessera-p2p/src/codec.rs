use std::io;

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::{request_response as rr, StreamProtocol};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::{SyncRequest, SyncResponse};

/// Upper bound for one framed message; a block window fits comfortably.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// 4-byte big-endian length prefix followed by a bincode body.
#[derive(Debug, Clone, Default)]
pub struct SyncCodec;

async fn read_frame<T, M>(io: &mut T) -> io::Result<M>
where
    T: AsyncRead + Unpin + Send,
    M: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, format!("frame of {len} bytes")));
    }

    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    bincode::deserialize(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

async fn write_frame<T, M>(io: &mut T, msg: &M) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
    M: Serialize,
{
    let bytes = bincode::serialize(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, format!("frame of {} bytes", bytes.len())));
    }
    io.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    io.write_all(&bytes).await?;
    io.flush().await
}

#[async_trait]
impl rr::Codec for SyncCodec {
    type Protocol = StreamProtocol;
    type Request = SyncRequest;
    type Response = SyncResponse;

    async fn read_request<T>(&mut self, _protocol: &Self::Protocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_frame(io).await
    }

    async fn read_response<T>(&mut self, _protocol: &Self::Protocol, io: &mut T) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_frame(io).await
    }

    async fn write_request<T>(&mut self, _protocol: &Self::Protocol, io: &mut T, req: Self::Request) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_frame(io, &req).await
    }

    async fn write_response<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
        res: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_frame(io, &res).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::Cursor;
    use tessera_common::env::Height;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let mut codec = SyncCodec;
        let proto = StreamProtocol::new("/tessera/sync/1");

        let mut buf = Cursor::new(Vec::new());
        rr::Codec::write_request(&mut codec, &proto, &mut buf, SyncRequest::Blocks(vec![Height(3)]))
            .await
            .unwrap();

        let written = buf.into_inner();
        assert_eq!(u32::from_be_bytes(written[..4].try_into().unwrap()) as usize, written.len() - 4);

        let mut rd = Cursor::new(written);
        let req = rr::Codec::read_request(&mut codec, &proto, &mut rd).await.unwrap();
        assert_eq!(req, SyncRequest::Blocks(vec![Height(3)]));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut codec = SyncCodec;
        let proto = StreamProtocol::new("/tessera/sync/1");
        let mut rd = Cursor::new(((MAX_FRAME_SIZE + 1) as u32).to_be_bytes().to_vec());
        let err = rr::Codec::read_response(&mut codec, &proto, &mut rd).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
