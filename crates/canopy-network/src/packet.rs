use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::{decode, Message, MessageTypeId};
use crate::{NetworkError, ServerIdentity};

/// What goes on the wire for every message: the body's type id and its bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Frame {
    pub msg_type: MessageTypeId,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

/// An inbound message handed to a [`Processor`](crate::Processor).
#[derive(Debug, Clone)]
pub struct Packet {
    /// The sender, as announced when its connection opened.
    pub server_identity: ServerIdentity,
    pub msg_type: MessageTypeId,
    pub payload: Vec<u8>,
    /// Size of the frame on the wire, zero for local short-circuits.
    pub size: usize,
}

impl Packet {
    pub fn is<M: Message>(&self) -> bool {
        self.msg_type == M::message_type()
    }

    /// Decode the payload as `M`, checking the type id first.
    pub fn decode<M: Message>(&self) -> Result<M, NetworkError> {
        let expected = M::message_type();
        if self.msg_type != expected {
            return Err(NetworkError::TypeMismatch {
                expected,
                actual: self.msg_type,
            });
        }
        decode(&self.payload)
    }
}

/// Write a length-prefixed frame.
pub(crate) async fn write_framed<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> std::io::Result<()> {
    let len = (data.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed frame.
pub(crate) async fn read_framed<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Vec<u8>, NetworkError> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(NetworkError::Receive)?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(NetworkError::MessageTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(NetworkError::Receive)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Address, KeyPair};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Hello {
        text: String,
    }

    impl Message for Hello {
        const NAME: &'static str = "Hello";
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Other;

    impl Message for Other {
        const NAME: &'static str = "Other";
    }

    fn packet_of<M: Message>(msg: &M) -> Packet {
        let si = ServerIdentity::new(KeyPair::from_seed(1).public, Address::local("127.0.0.1", 1));
        Packet {
            server_identity: si,
            msg_type: M::message_type(),
            payload: crate::encode(msg).unwrap(),
            size: 0,
        }
    }

    #[test]
    fn decode_checks_type() {
        let packet = packet_of(&Hello { text: "hi".into() });
        assert!(packet.is::<Hello>());
        assert_eq!(packet.decode::<Hello>().unwrap().text, "hi");
        assert!(matches!(
            packet.decode::<Other>(),
            Err(NetworkError::TypeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn framing_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_framed(&mut a, b"frame one").await.unwrap();
        write_framed(&mut a, b"").await.unwrap();
        assert_eq!(read_framed(&mut b, 64).await.unwrap(), b"frame one");
        assert!(read_framed(&mut b, 64).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn framing_rejects_oversize() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_framed(&mut a, &[0u8; 100]).await.unwrap();
        assert!(matches!(
            read_framed(&mut b, 10).await,
            Err(NetworkError::MessageTooLarge { size: 100, max: 10 })
        ));
    }
}
