//! A framed, bidirectional message channel over any byte stream.
use crate::message::{FrameCodec, Message};
use crate::Result;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, FramedWrite};

use std::net::SocketAddr;

pub struct Receiver<S> {
    reader: FramedRead<ReadHalf<S>, FrameCodec>,
}

impl<S: AsyncRead> Receiver<S> {
    /// The next message, or `None` once the peer closed the stream.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        match self.reader.next().await {
            Some(message) => Ok(Some(message?)),
            None => Ok(None),
        }
    }
}

pub struct Sender<S> {
    writer: FramedWrite<WriteHalf<S>, FrameCodec>,
}

impl<S: AsyncWrite> Sender<S> {
    pub async fn send(&mut self, message: Message) -> Result<()> {
        self.writer.send(message).await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.writer.close().await
    }
}

pub struct Channel<S> {
    sender: Sender<S>,
    receiver: Receiver<S>,
}

impl<S: AsyncRead + AsyncWrite> Channel<S> {
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let reader = FramedRead::new(reader, FrameCodec::new());
        let writer = FramedWrite::new(writer, FrameCodec::new());
        Channel { sender: Sender { writer }, receiver: Receiver { reader } }
    }

    pub async fn send(&mut self, message: Message) -> Result<()> {
        self.sender.send(message).await
    }

    pub async fn recv(&mut self) -> Result<Option<Message>> {
        self.receiver.recv().await
    }

    pub fn split(self) -> (Sender<S>, Receiver<S>) {
        (self.sender, self.receiver)
    }
}

impl Channel<TcpStream> {
    pub async fn connect(address: &SocketAddr) -> Result<Channel<TcpStream>> {
        let socket = TcpStream::connect(address).await?;
        socket.set_nodelay(true)?;
        Ok(Channel::new(socket))
    }

    pub async fn accept(listener: &TcpListener) -> Result<(Channel<TcpStream>, SocketAddr)> {
        let (socket, address) = listener.accept().await?;
        socket.set_nodelay(true)?;
        Ok((Channel::new(socket), address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use crate::zfx_id::Id;

    #[actix_rt::test]
    async fn send_recv_over_duplex() {
        let (left, right) = tokio::io::duplex(4096);
        let mut left = Channel::new(left);
        let (mut sender, mut receiver) = Channel::new(right).split();

        let ping = Message::new(MessageType::Data, Id::one(), Id::two(), b"123".to_vec());
        left.send(ping.clone()).await.unwrap();
        assert_eq!(receiver.recv().await.unwrap(), Some(ping));

        let pong = Message::new(MessageType::Data, Id::two(), Id::one(), vec![7u8; 10_000]);
        // Larger than the pipe, so the write only completes while the other end reads.
        let (sent, received) = tokio::join!(sender.send(pong.clone()), left.recv());
        sent.unwrap();
        assert_eq!(received.unwrap(), Some(pong));

        drop(left);
        assert_eq!(receiver.recv().await.unwrap(), None);
    }

    #[actix_rt::test]
    async fn send_recv_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut channel, _) = Channel::accept(&listener).await.unwrap();
            let message = channel.recv().await.unwrap().unwrap();
            channel.send(message).await.unwrap();
        });
        let mut channel = Channel::connect(&address).await.unwrap();
        let message = Message::heartbeat(Id::one(), Id::two());
        channel.send(message.clone()).await.unwrap();
        assert_eq!(channel.recv().await.unwrap(), Some(message));
        server.await.unwrap();
    }
}
