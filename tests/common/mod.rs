//! Raw-packet test client and broker launcher shared by the integration tests

#![allow(dead_code)]

use sentel_broker::broker::{BrokerConfig, EventLog, MqttBroker, ShutdownHandle, SubscriptionRouter};
use sentel_broker::packet::connack::ConnAckPacket;
use sentel_broker::packet::connect::ConnectPacket;
use sentel_broker::packet::suback::SubAckPacket;
use sentel_broker::packet::subscribe::SubscribePacket;
use sentel_broker::transport::{write_packet, PacketReader};
use sentel_broker::{Packet, PacketCodec, PublishPacket, QoS};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

static TRACING: Once = Once::new();

/// Routes broker logs through the test harness; filtered by `RUST_LOG`
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A broker running in the background on a loopback port
pub struct TestBroker {
    pub addr: SocketAddr,
    pub node_id: String,
    pub router: Arc<SubscriptionRouter>,
    handle: ShutdownHandle,
}

impl TestBroker {
    pub async fn start(config: BrokerConfig) -> Self {
        Self::launch(config, None).await
    }

    pub async fn start_clustered(config: BrokerConfig, log: Arc<dyn EventLog>) -> Self {
        Self::launch(config, Some(log)).await
    }

    async fn launch(config: BrokerConfig, log: Option<Arc<dyn EventLog>>) -> Self {
        init_tracing();
        let config = config.with_bind_address("127.0.0.1:0".parse::<SocketAddr>().unwrap());
        let mut broker = MqttBroker::with_config(config).await.unwrap();
        if let Some(log) = log {
            broker = broker.with_cluster(log).await.unwrap();
        }
        let broker_info = Self {
            addr: broker.local_addr(),
            node_id: broker.node_id().to_string(),
            router: broker.router(),
            handle: broker.shutdown_handle(),
        };
        tokio::spawn(async move { broker.run().await });
        broker_info
    }

    pub async fn client(&self) -> RawClient {
        RawClient::connect_tcp(self.addr).await
    }

    pub fn shutdown(&self) {
        self.handle.shutdown();
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.handle.shutdown();
    }
}

/// MQTT client speaking raw packets over TCP
pub struct RawClient {
    reader: PacketReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl RawClient {
    pub async fn connect_tcp(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, writer) = stream.into_split();
        Self {
            reader: PacketReader::new(read, PacketCodec::default()),
            writer,
        }
    }

    pub async fn send(&mut self, packet: Packet) {
        write_packet(&mut self.writer, &packet).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub async fn recv(&mut self) -> Packet {
        timeout(RECV_TIMEOUT, self.reader.read_packet())
            .await
            .expect("timed out waiting for packet")
            .unwrap()
    }

    /// Next packet, or `None` if nothing arrives within `wait`
    pub async fn try_recv(&mut self, wait: Duration) -> Option<Packet> {
        match timeout(wait, self.reader.read_packet()).await {
            Ok(Ok(packet)) => Some(packet),
            Ok(Err(e)) => panic!("connection failed: {e}"),
            Err(_) => None,
        }
    }

    /// Whether the broker closes the connection within `wait`
    pub async fn closed_within(&mut self, wait: Duration) -> bool {
        matches!(timeout(wait, self.reader.read_packet()).await, Ok(Err(_)))
    }

    pub async fn connect(&mut self, connect: ConnectPacket) -> ConnAckPacket {
        self.send(Packet::Connect(Box::new(connect))).await;
        match self.recv().await {
            Packet::ConnAck(connack) => connack,
            other => panic!("expected CONNACK, got {other:?}"),
        }
    }

    pub async fn subscribe(&mut self, packet_id: u16, filter: &str, qos: QoS) -> SubAckPacket {
        self.send(Packet::Subscribe(SubscribePacket::new(packet_id).add_filter(filter, qos)))
            .await;
        match self.recv().await {
            Packet::SubAck(suback) => suback,
            other => panic!("expected SUBACK, got {other:?}"),
        }
    }

    pub async fn recv_publish(&mut self) -> PublishPacket {
        match self.recv().await {
            Packet::Publish(publish) => publish,
            other => panic!("expected PUBLISH, got {other:?}"),
        }
    }

    pub async fn disconnect(mut self) {
        self.send(Packet::Disconnect).await;
        let _ = self.writer.shutdown().await;
    }
}

/// Gives background replication and session cleanup time to settle
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}
