//! Client connection handler for the MQTT broker
//!
//! One [`ClientHandler`] serves one accepted connection. A reader task decodes
//! packets into a bounded inbox; the handler loop takes one input at a time
//! from that inbox, the outbound queue, the keepalive deadline, a takeover
//! signal and the broker shutdown signal. Packets of one client are therefore
//! handled strictly in order, and no per-session state is shared with other
//! tasks except the outbound queue.

use crate::broker::auth::{Action, AuthOptions, AuthProvider};
use crate::broker::config::BrokerConfig;
use crate::broker::event::{Event, EventBus, EventDetail};
use crate::broker::router::SubscriptionRouter;
use crate::broker::stats::BrokerStats;
use crate::codec::PacketCodec;
use crate::constants::time::KEEP_ALIVE_GRACE_MILLIS;
use crate::error::{MqttError, Result};
use crate::packet::ack::{PubAckPacket, PubCompPacket, UnsubAckPacket};
use crate::packet::connack::{ConnAckPacket, ConnectReturnCode};
use crate::packet::connect::ConnectPacket;
use crate::packet::publish::PublishPacket;
use crate::packet::suback::SubAckPacket;
use crate::packet::subscribe::SubscribePacket;
use crate::packet::unsubscribe::UnsubscribePacket;
use crate::packet::Packet;
use crate::session::{MessageState, Mountpoint, OutboundQueue, SessionState};
use crate::transport::{write_packet, PacketReader};
use crate::types::{Message, ProtocolVersion, WillMessage};
use crate::validation::{validate_topic_filter, validate_topic_name};
use crate::QoS;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, instrument, warn};

type Inbound = Result<(Packet, usize)>;

/// What the loop does after a packet was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Disconnect,
}

/// State that exists once CONNECT was accepted
#[derive(Debug)]
struct Session {
    client_id: String,
    username: Option<String>,
    protocol: ProtocolVersion,
    clean_session: bool,
    keep_alive: Option<Duration>,
    will: Option<WillMessage>,
    queue: OutboundQueue,
    generation: u64,
    takeover: Arc<Notify>,
    message_state: MessageState,
}

/// Handles a single client connection
pub struct ClientHandler<T> {
    writer: WriteHalf<T>,
    reader: Option<ReadHalf<T>>,
    client_addr: SocketAddr,
    config: Arc<BrokerConfig>,
    router: Arc<SubscriptionRouter>,
    bus: Arc<EventBus>,
    auth_provider: Arc<dyn AuthProvider>,
    stats: Arc<BrokerStats>,
    shutdown_rx: broadcast::Receiver<()>,
    node_id: String,
    mountpoint: Mountpoint,
    state: SessionState,
}

impl<T> ClientHandler<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Creates a new client handler
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: T,
        client_addr: SocketAddr,
        config: Arc<BrokerConfig>,
        router: Arc<SubscriptionRouter>,
        bus: Arc<EventBus>,
        auth_provider: Arc<dyn AuthProvider>,
        stats: Arc<BrokerStats>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let node_id = config.effective_node_id();
        let mountpoint = Mountpoint::new(config.mountpoint.clone());
        Self {
            writer,
            reader: Some(reader),
            client_addr,
            config,
            router,
            bus,
            auth_provider,
            stats,
            shutdown_rx,
            node_id,
            mountpoint,
            state: SessionState::New,
        }
    }

    /// Runs the client handler until disconnection or error
    ///
    /// # Errors
    ///
    /// Returns the error that ended the session. A DISCONNECT from the client
    /// or a broker shutdown ends it with `Ok`.
    #[instrument(name = "session", skip_all, fields(addr = %self.client_addr))]
    pub async fn run(mut self) -> Result<()> {
        let (inbox_tx, mut inbox) = mpsc::channel(self.config.inbox_capacity);
        let reader_task = self.spawn_reader(inbox_tx)?;

        let connect = match timeout(self.config.connect_timeout, inbox.recv()).await {
            Err(_) => {
                warn!("Connect timeout");
                Err(MqttError::Timeout)
            }
            Ok(None) => Err(MqttError::ClientClosed),
            Ok(Some(Ok((Packet::Connect(connect), len)))) => {
                self.stats.message_received(len);
                Ok(*connect)
            }
            Ok(Some(Ok((other, _)))) => Err(MqttError::ProtocolError(format!(
                "Expected CONNECT, got {:?}",
                other.packet_type()
            ))),
            Ok(Some(Err(MqttError::UnsupportedProtocolVersion))) => {
                self.send(Packet::ConnAck(ConnAckPacket::refused(
                    ConnectReturnCode::UnacceptableProtocolVersion,
                )))
                .await?;
                Err(MqttError::UnsupportedProtocolVersion)
            }
            Ok(Some(Err(e))) => Err(e),
        };

        let mut session = match connect {
            Ok(connect) => match self.handle_connect(connect).await {
                Ok(session) => session,
                Err(e) => {
                    reader_task.abort();
                    self.close_transport().await;
                    return Err(e);
                }
            },
            Err(e) => {
                debug!("Connection closed before CONNECT: {e}");
                reader_task.abort();
                self.close_transport().await;
                return Err(e);
            }
        };

        self.stats.client_connected();
        info!(client_id = %session.client_id, clean_session = session.clean_session, "Client connected");

        let result = self.serve(&mut session, &mut inbox).await;
        reader_task.abort();
        self.finish(&mut session, &result).await;
        self.stats.client_disconnected();
        self.close_transport().await;

        match &result {
            Ok(()) => info!(client_id = %session.client_id, "Client disconnected"),
            Err(MqttError::ClientClosed) => {
                info!(client_id = %session.client_id, "Client closed connection");
            }
            Err(e) => info!(client_id = %session.client_id, "Session ended: {e}"),
        }
        result
    }

    fn spawn_reader(&mut self, inbox: mpsc::Sender<Inbound>) -> Result<JoinHandle<()>> {
        let reader = self
            .reader
            .take()
            .ok_or_else(|| MqttError::InvalidState("reader already started".to_string()))?;
        let codec = PacketCodec::new(self.config.max_packet_size, self.config.message_size_limit);

        Ok(tokio::spawn(async move {
            let mut reader = PacketReader::new(reader, codec);
            loop {
                let inbound = reader
                    .read_packet()
                    .await
                    .map(|packet| (packet, reader.last_frame_len()));
                let failed = inbound.is_err();
                if inbox.send(inbound).await.is_err() || failed {
                    return;
                }
            }
        }))
    }

    async fn send(&mut self, packet: Packet) -> Result<()> {
        let len = write_packet(&mut self.writer, &packet).await?;
        if matches!(packet, Packet::Publish(_)) {
            self.stats.publish_sent(len);
        } else {
            self.stats.message_sent(len);
        }
        Ok(())
    }

    async fn close_transport(&mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!("Transport shutdown failed: {e}");
        }
    }

    fn event(&self, session: &Session, detail: EventDetail) -> Event {
        Event::new(self.node_id.clone(), session.client_id.clone(), detail)
    }

    async fn refuse(&mut self, code: ConnectReturnCode) -> Result<()> {
        self.send(Packet::ConnAck(ConnAckPacket::refused(code))).await
    }

    /// Handles CONNECT packet
    async fn handle_connect(&mut self, connect: ConnectPacket) -> Result<Session> {
        debug!(client_id = %connect.client_id, protocol = ?connect.protocol, "Processing CONNECT packet");

        let options = match AuthOptions::parse(
            &connect.client_id,
            connect.username.as_deref(),
            connect.password.as_ref(),
        ) {
            Ok(options) => options,
            Err(MqttError::ClientIdentifierNotValid) => {
                self.refuse(ConnectReturnCode::IdentifierRejected).await?;
                return Err(MqttError::ClientIdentifierNotValid);
            }
            Err(e) => return Err(e),
        };

        if options.username.is_none() && !self.config.allow_anonymous {
            debug!(client_id = %options.client_id, "Anonymous connection refused");
            self.refuse(ConnectReturnCode::NotAuthorized).await?;
            return Err(MqttError::AuthenticationFailed);
        }

        let auth_result = self.auth_provider.authenticate(&options).await?;
        if !auth_result.authenticated {
            debug!(client_id = %options.client_id, code = ?auth_result.return_code, "Authentication failed");
            self.refuse(auth_result.return_code).await?;
            return Err(MqttError::AuthenticationFailed);
        }

        let will = match connect.will {
            Some(mut will) => {
                validate_topic_name(&will.topic)?;
                will.topic = self.mountpoint.apply(&will.topic);
                Some(will)
            }
            None => None,
        };

        self.state = self.state.transition(SessionState::Connected)?;
        let registration = self
            .router
            .register_session(&options.client_id, connect.clean_session)
            .await;

        let mut session = Session {
            client_id: options.client_id,
            username: auth_result.user_id.or(options.username),
            protocol: connect.protocol,
            clean_session: connect.clean_session,
            keep_alive: (connect.keep_alive > 0).then(|| {
                Duration::from_millis(u64::from(connect.keep_alive) * KEEP_ALIVE_GRACE_MILLIS)
            }),
            will,
            queue: registration.queue,
            generation: registration.generation,
            takeover: registration.takeover,
            message_state: MessageState::Queued,
        };

        if session.will.is_some() {
            self.revalidate_queue(&session).await;
        }

        match self.accept(&mut session, registration.resumed).await {
            Ok(()) => Ok(session),
            Err(e) => {
                self.finish(&mut session, &Err(e.clone())).await;
                Err(e)
            }
        }
    }

    /// Answers CONNECT and flushes whatever a resumed session has queued
    async fn accept(&mut self, session: &mut Session, resumed: bool) -> Result<()> {
        // Session present is only defined from 3.1.1 on
        let session_present = resumed && session.protocol == ProtocolVersion::V311;
        self.send(Packet::ConnAck(ConnAckPacket::new(
            session_present,
            ConnectReturnCode::Accepted,
        )))
        .await?;

        let detail = if resumed {
            EventDetail::SessionResumed
        } else {
            EventDetail::SessionCreated {
                persistent: !session.clean_session,
            }
        };
        self.bus.notify(&self.event(session, detail)).await;

        if let Some(message) = session.queue.redelivery() {
            debug!(client_id = %session.client_id, "Redelivering unacknowledged message");
            self.deliver(session, message).await?;
        }
        self.drain_queue(session).await
    }

    /// Drops queued messages on topics the client may no longer read
    async fn revalidate_queue(&self, session: &Session) {
        let mut denied = Vec::new();
        for topic in session.queue.topics() {
            let visible = self.mountpoint.strip(&topic);
            let allowed = self
                .auth_provider
                .authorize(&session.client_id, session.username.as_deref(), visible, Action::Read)
                .await
                .unwrap_or(false);
            if !allowed {
                denied.push(topic);
            }
        }
        if !denied.is_empty() {
            self.router
                .delete_message_with_validator(&session.client_id, |message| {
                    !denied.contains(&message.topic)
                })
                .await;
        }
    }

    async fn serve(&mut self, session: &mut Session, inbox: &mut mpsc::Receiver<Inbound>) -> Result<()> {
        let mut last_activity = Instant::now();
        loop {
            let deadline = session.keep_alive.map(|grace| last_activity + grace);
            let queue = session.queue.clone();
            let takeover = Arc::clone(&session.takeover);
            let ready_to_send = session.message_state == MessageState::Queued;

            tokio::select! {
                biased;
                () = takeover.notified() => {
                    info!(client_id = %session.client_id, "Session taken over by a new connection");
                    return Err(MqttError::SessionTakenOver);
                }
                _ = self.shutdown_rx.recv() => {
                    debug!(client_id = %session.client_id, "Shutdown signal received");
                    return Ok(());
                }
                inbound = inbox.recv() => {
                    let (packet, len) = inbound.unwrap_or(Err(MqttError::ClientClosed))?;
                    last_activity = Instant::now();
                    if matches!(packet, Packet::Publish(_)) {
                        self.stats.publish_received(len);
                    } else {
                        self.stats.message_received(len);
                    }
                    match self.handle_packet(session, packet).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Disconnect) => return Ok(()),
                        Err(e) if !e.is_session_fatal() => {
                            warn!(client_id = %session.client_id, "Operation refused: {e}");
                        }
                        Err(e) => return Err(e),
                    }
                }
                () = queue.notified(), if ready_to_send => {
                    self.drain_queue(session).await?;
                }
                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    warn!(client_id = %session.client_id, "Keep-alive timeout");
                    return Err(MqttError::KeepAliveTimeout);
                }
            }
        }
    }

    /// Handles a single packet
    async fn handle_packet(&mut self, session: &mut Session, packet: Packet) -> Result<Flow> {
        match packet {
            Packet::Publish(publish) => self.handle_publish(session, publish).await,
            Packet::PubAck(puback) => {
                self.handle_puback(session, puback.packet_id).await?;
                Ok(Flow::Continue)
            }
            Packet::PubRel(pubrel) => {
                self.send(Packet::PubComp(PubCompPacket::new(pubrel.packet_id)))
                    .await?;
                Ok(Flow::Continue)
            }
            Packet::PubRec(_) | Packet::PubComp(_) => {
                debug!(client_id = %session.client_id, "Ignoring QoS 2 acknowledgement");
                Ok(Flow::Continue)
            }
            Packet::Subscribe(subscribe) => self.handle_subscribe(session, subscribe).await,
            Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(session, unsubscribe).await,
            Packet::PingReq => {
                self.send(Packet::PingResp).await?;
                Ok(Flow::Continue)
            }
            Packet::Disconnect => {
                self.state = self.state.transition(SessionState::Disconnecting)?;
                session.will = None;
                Ok(Flow::Disconnect)
            }
            Packet::Connect(_) => Err(MqttError::ProtocolError("Duplicate CONNECT".to_string())),
            other => Err(MqttError::ProtocolError(format!(
                "Unexpected {:?} from client",
                other.packet_type()
            ))),
        }
    }

    async fn handle_publish(&mut self, session: &mut Session, publish: PublishPacket) -> Result<Flow> {
        if publish.qos == QoS::ExactlyOnce {
            return Err(MqttError::QoSNotSupported);
        }
        validate_topic_name(&publish.topic_name)?;

        let packet_id = match publish.qos {
            QoS::AtMostOnce => None,
            _ => Some(publish.packet_id.ok_or_else(|| {
                MqttError::MalformedPacket("QoS 1 PUBLISH without packet identifier".to_string())
            })?),
        };

        if let Some(id) = packet_id {
            if publish.dup && session.queue.inbound_acknowledged(id) {
                debug!(client_id = %session.client_id, packet_id = id, "Duplicate PUBLISH acknowledged again");
                self.send(Packet::PubAck(PubAckPacket::new(id))).await?;
                return Ok(Flow::Continue);
            }
        }

        let authorized = self
            .auth_provider
            .authorize(
                &session.client_id,
                session.username.as_deref(),
                &publish.topic_name,
                Action::Write,
            )
            .await?;

        if authorized {
            let message = Message {
                topic: self.mountpoint.apply(&publish.topic_name),
                payload: publish.payload,
                qos: publish.qos,
                retain: publish.retain,
                dup: false,
                packet_id: None,
            };
            debug!(client_id = %session.client_id, topic = %message.topic, qos = ?message.qos, "PUBLISH accepted");
            self.bus
                .notify(&self.event(session, EventDetail::TopicPublished { message }))
                .await;
        }

        // 3.1.1 has no negative PUBACK; a refused QoS 1 publish is still acknowledged
        if let Some(id) = packet_id {
            self.send(Packet::PubAck(PubAckPacket::new(id))).await?;
            session.queue.remember_inbound_ack(id);
        }

        if authorized {
            Ok(Flow::Continue)
        } else {
            Err(MqttError::NotAuthorized)
        }
    }

    async fn handle_puback(&mut self, session: &mut Session, packet_id: u16) -> Result<()> {
        match session.message_state {
            MessageState::WaitingAck { packet_id: expected } if expected == packet_id => {
                session.queue.acknowledge(packet_id);
                session.message_state = MessageState::Queued;
                self.drain_queue(session).await
            }
            _ => {
                debug!(client_id = %session.client_id, packet_id, "PUBACK for unknown packet id");
                Ok(())
            }
        }
    }

    /// Handles SUBSCRIBE packet
    async fn handle_subscribe(&mut self, session: &mut Session, subscribe: SubscribePacket) -> Result<Flow> {
        if subscribe.filters.is_empty() && session.protocol == ProtocolVersion::V311 {
            return Err(MqttError::ProtocolError(
                "SUBSCRIBE without topic filters".to_string(),
            ));
        }

        let mut suback = SubAckPacket::new(subscribe.packet_id);
        let mut granted_filters = Vec::new();

        for filter in &subscribe.filters {
            if let Err(e) = validate_topic_filter(&filter.filter) {
                debug!(client_id = %session.client_id, "Refusing subscription: {e}");
                suback.push_failure();
                continue;
            }

            let authorized = match self
                .auth_provider
                .authorize(&session.client_id, session.username.as_deref(), &filter.filter, Action::Read)
                .await
            {
                Ok(authorized) => authorized,
                Err(e) => {
                    warn!(client_id = %session.client_id, filter = %filter.filter, "Authorization check failed: {e}");
                    false
                }
            };
            if !authorized {
                debug!(client_id = %session.client_id, filter = %filter.filter, "Subscription not authorized");
                suback.push_failure();
                continue;
            }

            let granted = filter.qos.min(QoS::AtLeastOnce);
            let routed = self.mountpoint.apply(&filter.filter);
            self.bus
                .notify(&self.event(
                    session,
                    EventDetail::TopicSubscribed {
                        topic: routed.clone(),
                        qos: granted,
                    },
                ))
                .await;
            suback.push_granted(granted);
            granted_filters.push((routed, granted));
        }

        self.send(Packet::SubAck(suback)).await?;

        for (routed, granted) in granted_filters {
            for mut retained in self.router.retained_messages(&routed).await {
                retained.qos = retained.qos.min(granted);
                if !session.queue.push(retained) {
                    self.stats.message_dropped();
                }
            }
        }
        self.drain_queue(session).await?;
        Ok(Flow::Continue)
    }

    /// Handles UNSUBSCRIBE packet
    async fn handle_unsubscribe(
        &mut self,
        session: &mut Session,
        unsubscribe: UnsubscribePacket,
    ) -> Result<Flow> {
        if unsubscribe.filters.is_empty() && session.protocol == ProtocolVersion::V311 {
            return Err(MqttError::ProtocolError(
                "UNSUBSCRIBE without topic filters".to_string(),
            ));
        }

        for filter in &unsubscribe.filters {
            validate_topic_filter(filter)?;
        }

        for filter in &unsubscribe.filters {
            let routed = self.mountpoint.apply(filter);
            self.bus
                .notify(&self.event(session, EventDetail::TopicUnsubscribed { topic: routed }))
                .await;
        }
        self.send(Packet::UnsubAck(UnsubAckPacket::new(unsubscribe.packet_id)))
            .await?;
        Ok(Flow::Continue)
    }

    /// Writes queued messages until the queue is empty or a `QoS` 1 message waits for its PUBACK
    async fn drain_queue(&mut self, session: &mut Session) -> Result<()> {
        while session.message_state == MessageState::Queued {
            let Some(message) = session.queue.next_dispatch() else {
                break;
            };
            self.deliver(session, message).await?;
        }
        Ok(())
    }

    async fn deliver(&mut self, session: &mut Session, message: Message) -> Result<()> {
        let topic = self.mountpoint.strip(&message.topic).to_string();
        let mut publish = PublishPacket::new(topic, message.payload, message.qos)
            .with_retain(message.retain)
            .with_dup(message.dup);
        if let Some(packet_id) = message.packet_id {
            publish = publish.with_packet_id(packet_id);
            session.message_state = MessageState::WaitingAck { packet_id };
        }
        self.send(Packet::Publish(publish)).await
    }

    /// Routing cleanup once the loop has ended
    async fn finish(&mut self, session: &mut Session, result: &Result<()>) {
        if let Ok(state) = self.state.transition(SessionState::Disconnected) {
            self.state = state;
        }

        let taken_over = matches!(result, Err(MqttError::SessionTakenOver));
        let detached = !taken_over
            && self
                .router
                .detach_session(&session.client_id, session.generation)
                .await;

        if let Some(will) = session.will.take() {
            self.publish_will(session, will).await;
        }

        if detached && session.clean_session {
            self.bus
                .notify(&self.event(session, EventDetail::SessionDestroyed))
                .await;
        }
    }

    async fn publish_will(&self, session: &Session, will: WillMessage) {
        let visible = self.mountpoint.strip(&will.topic);
        let allowed = self
            .auth_provider
            .authorize(&session.client_id, session.username.as_deref(), visible, Action::Write)
            .await
            .unwrap_or(false);
        if !allowed {
            warn!(client_id = %session.client_id, topic = %will.topic, "Will message not authorized");
            return;
        }

        debug!(client_id = %session.client_id, topic = %will.topic, "Publishing will message");
        let message = will.to_message();
        self.bus
            .notify(&self.event(session, EventDetail::TopicPublished { message }))
            .await;
    }
}
