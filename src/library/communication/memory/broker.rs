use super::super::matching::matches_topic;
use super::super::message::{InboundMessage, MessageProperties};
use super::super::transport::{
    ChannelKind, ExchangeKind, TransportCommand, TransportEvent, REPLY_NOT_FOUND,
    REPLY_PRECONDITION_FAILED, REPLY_RESOURCE_LOCKED, REPLY_SUCCESS,
};
use log::{debug, trace, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

type LinkId = u64;

/// Operation processed by the broker task
pub(super) enum BrokerOp {
    Attach {
        link: LinkId,
        events: mpsc::UnboundedSender<TransportEvent>,
        outbound: Arc<AtomicUsize>,
    },
    Command {
        link: LinkId,
        command: TransportCommand,
    },
    Detach {
        link: LinkId,
    },
    Depth {
        queue: String,
        reply: oneshot::Sender<usize>,
    },
    DeleteQueue {
        queue: String,
    },
}

struct LinkState {
    events: mpsc::UnboundedSender<TransportEvent>,
    outbound: Arc<AtomicUsize>,
    connected: bool,
    channels: HashSet<ChannelKind>,
    prefetch: u16,
}

struct ExchangeState {
    kind: ExchangeKind,
    bindings: Vec<QueueBinding>,
}

#[derive(PartialEq)]
struct QueueBinding {
    queue: String,
    binding_key: String,
}

#[derive(Clone)]
struct StoredMessage {
    routing_key: String,
    body: Vec<u8>,
    properties: MessageProperties,
}

struct ConsumerState {
    link: LinkId,
    tag: String,
    in_flight: HashMap<u64, StoredMessage>,
    next_delivery_tag: u64,
}

struct QueueState {
    ready: VecDeque<StoredMessage>,
    exclusive_owner: Option<LinkId>,
    dead_letter_exchange: Option<String>,
    consumer: Option<ConsumerState>,
}

#[derive(Default)]
pub(super) struct BrokerCore {
    links: HashMap<LinkId, LinkState>,
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
}

impl BrokerCore {
    pub(super) async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<BrokerOp>) {
        debug!("In-process broker started");

        while let Some(op) = inbox.recv().await {
            self.apply(op);
        }

        debug!("In-process broker shut down");
    }

    fn apply(&mut self, op: BrokerOp) {
        match op {
            BrokerOp::Attach {
                link,
                events,
                outbound,
            } => {
                self.links.insert(
                    link,
                    LinkState {
                        events,
                        outbound,
                        connected: false,
                        channels: HashSet::new(),
                        prefetch: 0,
                    },
                );
            }
            BrokerOp::Command { link, command } => {
                let is_publish = matches!(command, TransportCommand::Publish(_));

                self.handle_command(link, command);

                if is_publish {
                    if let Some(state) = self.links.get(&link) {
                        state.outbound.fetch_sub(1, Ordering::SeqCst);
                    }
                }
            }
            BrokerOp::Detach { link } => self.drop_link(link),
            BrokerOp::Depth { queue, reply } => {
                let depth = self
                    .queues
                    .get(&queue)
                    .map(|q| {
                        q.ready.len()
                            + q.consumer
                                .as_ref()
                                .map(|c| c.in_flight.len())
                                .unwrap_or_default()
                    })
                    .unwrap_or_default();

                reply.send(depth).ok();
            }
            BrokerOp::DeleteQueue { queue } => self.delete_queue(&queue),
        }
    }

    fn handle_command(&mut self, link: LinkId, command: TransportCommand) {
        trace!("Link {} issued {:?}", link, command);

        match command {
            TransportCommand::Connect => {
                if let Some(state) = self.links.get_mut(&link) {
                    state.connected = true;
                }
                self.send(link, TransportEvent::ConnectionOpened);
            }
            TransportCommand::OpenChannel(kind) => {
                if let Some(state) = self.links.get_mut(&link) {
                    state.channels.insert(kind);
                }
                self.send(link, TransportEvent::ChannelOpened(kind));
            }
            TransportCommand::DeclareExchange {
                channel,
                exchange,
                kind,
                durable: _,
            } => self.declare_exchange(link, channel, exchange, kind),
            TransportCommand::DeclareQueue {
                queue,
                durable,
                exclusive,
                dead_letter_exchange,
            } => self.declare_queue(link, queue, durable, exclusive, dead_letter_exchange),
            TransportCommand::BindQueue {
                queue,
                exchange,
                binding_key,
            } => self.bind_queue(link, queue, exchange, binding_key),
            TransportCommand::ConfigureQos { prefetch_count } => {
                if let Some(state) = self.links.get_mut(&link) {
                    state.prefetch = prefetch_count;
                }
                self.send(link, TransportEvent::QosConfigured);
            }
            TransportCommand::StartConsumer {
                queue,
                consumer_tag,
            } => self.start_consumer(link, queue, consumer_tag),
            TransportCommand::CancelConsumer { consumer_tag } => {
                self.cancel_consumer(link, &consumer_tag);
                self.send(link, TransportEvent::ConsumerCancelled { consumer_tag });
            }
            TransportCommand::Publish(message) => {
                let stored = StoredMessage {
                    routing_key: message.routing_key,
                    body: message.body,
                    properties: message.properties,
                };

                if !self.route(&message.exchange, stored) {
                    self.close_channel_with_error(
                        link,
                        ChannelKind::Output,
                        REPLY_NOT_FOUND,
                        format!("no exchange '{}'", message.exchange),
                    );
                }
            }
            TransportCommand::Ack { delivery_tag } => self.settle(link, delivery_tag, None),
            TransportCommand::Reject {
                delivery_tag,
                requeue,
            } => self.settle(link, delivery_tag, Some(requeue)),
            TransportCommand::CloseChannel(kind) => {
                if kind == ChannelKind::Input {
                    self.release_consumers(link);
                }
                if let Some(state) = self.links.get_mut(&link) {
                    state.channels.remove(&kind);
                }
                self.send(
                    link,
                    TransportEvent::ChannelClosed {
                        channel: kind,
                        code: REPLY_SUCCESS,
                        reason: "closed".to_string(),
                    },
                );
            }
            TransportCommand::CloseConnection => {
                self.release_consumers(link);
                self.drop_exclusive_queues(link);
                if let Some(state) = self.links.get_mut(&link) {
                    state.connected = false;
                    state.channels.clear();
                }
                self.send(
                    link,
                    TransportEvent::ConnectionClosed {
                        code: REPLY_SUCCESS,
                        reason: "closed".to_string(),
                    },
                );
            }
        }
    }

    fn declare_exchange(
        &mut self,
        link: LinkId,
        channel: ChannelKind,
        exchange: String,
        kind: ExchangeKind,
    ) {
        match self.exchanges.get(&exchange) {
            Some(existing) if existing.kind != kind => {
                self.close_channel_with_error(
                    link,
                    channel,
                    REPLY_PRECONDITION_FAILED,
                    format!("exchange '{}' already declared with a different kind", exchange),
                );
            }
            _ => {
                self.exchanges.entry(exchange.clone()).or_insert(ExchangeState {
                    kind,
                    bindings: Vec::new(),
                });
                self.send(link, TransportEvent::ExchangeDeclared { channel, exchange });
            }
        }
    }

    fn declare_queue(
        &mut self,
        link: LinkId,
        queue: String,
        durable: bool,
        exclusive: bool,
        dead_letter_exchange: Option<String>,
    ) {
        match self.queues.get(&queue) {
            Some(existing) if existing.exclusive_owner.map(|owner| owner != link).unwrap_or(false) => {
                self.close_channel_with_error(
                    link,
                    ChannelKind::Input,
                    REPLY_RESOURCE_LOCKED,
                    format!("queue '{}' is held exclusively by another connection", queue),
                );
            }
            Some(existing) if existing.dead_letter_exchange != dead_letter_exchange => {
                self.close_channel_with_error(
                    link,
                    ChannelKind::Input,
                    REPLY_PRECONDITION_FAILED,
                    format!("queue '{}' already declared with different arguments", queue),
                );
            }
            _ => {
                trace!("Queue '{}' declared (durable: {})", queue, durable);
                self.queues.entry(queue.clone()).or_insert(QueueState {
                    ready: VecDeque::new(),
                    exclusive_owner: exclusive.then(|| link),
                    dead_letter_exchange,
                    consumer: None,
                });
                self.send(link, TransportEvent::QueueDeclared { queue });
            }
        }
    }

    fn bind_queue(&mut self, link: LinkId, queue: String, exchange: String, binding_key: String) {
        if !self.queues.contains_key(&queue) {
            self.close_channel_with_error(
                link,
                ChannelKind::Input,
                REPLY_NOT_FOUND,
                format!("no queue '{}'", queue),
            );
            return;
        }

        let Some(state) = self.exchanges.get_mut(&exchange) else {
            self.close_channel_with_error(
                link,
                ChannelKind::Input,
                REPLY_NOT_FOUND,
                format!("no exchange '{}'", exchange),
            );
            return;
        };

        let binding = QueueBinding {
            queue: queue.clone(),
            binding_key: binding_key.clone(),
        };

        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }

        self.send(link, TransportEvent::QueueBound { queue, binding_key });
    }

    fn start_consumer(&mut self, link: LinkId, queue: String, consumer_tag: String) {
        let Some(state) = self.queues.get_mut(&queue) else {
            self.close_channel_with_error(
                link,
                ChannelKind::Input,
                REPLY_NOT_FOUND,
                format!("no queue '{}'", queue),
            );
            return;
        };

        if state.consumer.is_some() {
            self.close_channel_with_error(
                link,
                ChannelKind::Input,
                REPLY_RESOURCE_LOCKED,
                format!("queue '{}' already has a consumer", queue),
            );
            return;
        }

        state.consumer = Some(ConsumerState {
            link,
            tag: consumer_tag.clone(),
            in_flight: HashMap::new(),
            next_delivery_tag: 1,
        });

        self.send(link, TransportEvent::ConsumerStarted { consumer_tag });
        self.try_deliver(&queue);
    }

    /// Routes a message through an exchange, returning false when the exchange is unknown
    fn route(&mut self, exchange: &str, message: StoredMessage) -> bool {
        let Some(state) = self.exchanges.get(exchange) else {
            return false;
        };

        let targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|binding| match state.kind {
                ExchangeKind::Topic => matches_topic(&binding.binding_key, &message.routing_key),
                ExchangeKind::Direct => binding.binding_key == message.routing_key,
            })
            .map(|binding| binding.queue.clone())
            .collect();

        if targets.is_empty() {
            trace!(
                "Message with routing key '{}' matched no binding on '{}'",
                message.routing_key,
                exchange
            );
        }

        for queue in targets {
            if let Some(state) = self.queues.get_mut(&queue) {
                state.ready.push_back(message.clone());
            }
            self.try_deliver(&queue);
        }

        true
    }

    /// Resolves an acknowledgement or rejection for a delivery held by the link
    fn settle(&mut self, link: LinkId, delivery_tag: u64, requeue: Option<bool>) {
        let mut dead_letter: Option<(String, StoredMessage)> = None;

        for state in self.queues.values_mut() {
            let Some(consumer) = state.consumer.as_mut() else {
                continue;
            };

            if consumer.link != link {
                continue;
            }

            let Some(message) = consumer.in_flight.remove(&delivery_tag) else {
                continue;
            };

            match requeue {
                // Acknowledged, nothing left to do
                None => {}
                Some(true) => state.ready.push_front(message),
                Some(false) => {
                    if let Some(exchange) = &state.dead_letter_exchange {
                        dead_letter = Some((exchange.clone(), message));
                    }
                }
            }

            break;
        }

        if let Some((exchange, message)) = dead_letter {
            if !self.route(&exchange, message) {
                warn!("Dead-letter exchange '{}' does not exist, message dropped", exchange);
            }
        }

        let queues: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, state)| {
                state
                    .consumer
                    .as_ref()
                    .map(|consumer| consumer.link == link)
                    .unwrap_or(false)
            })
            .map(|(name, _)| name.clone())
            .collect();

        for queue in queues {
            self.try_deliver(&queue);
        }
    }

    fn try_deliver(&mut self, queue: &str) {
        loop {
            let Some((link_id, in_flight)) = self
                .queues
                .get(queue)
                .and_then(|state| state.consumer.as_ref())
                .map(|consumer| (consumer.link, consumer.in_flight.len()))
            else {
                return;
            };

            let Some((events, prefetch)) = self
                .links
                .get(&link_id)
                .map(|state| (state.events.clone(), state.prefetch))
            else {
                self.release_consumers(link_id);
                return;
            };

            if prefetch != 0 && in_flight >= prefetch as usize {
                return;
            }

            let Some(state) = self.queues.get_mut(queue) else {
                return;
            };

            let Some(message) = state.ready.pop_front() else {
                return;
            };

            let Some(consumer) = state.consumer.as_mut() else {
                state.ready.push_front(message);
                return;
            };

            let delivery_tag = consumer.next_delivery_tag;
            consumer.next_delivery_tag += 1;
            consumer.in_flight.insert(delivery_tag, message.clone());

            let delivery = InboundMessage {
                routing_key: message.routing_key.clone(),
                body: message.body.clone(),
                properties: message.properties.clone(),
                delivery_tag,
            };

            if events.send(TransportEvent::Delivery(delivery)).is_err() {
                consumer.in_flight.remove(&delivery_tag);
                state.ready.push_front(message);
                state.consumer = None;
                return;
            }
        }
    }

    /// Detaches a consumer owned by the link, returning its unacknowledged deliveries to the queue
    fn cancel_consumer(&mut self, link: LinkId, consumer_tag: &str) {
        for state in self.queues.values_mut() {
            let owned = state
                .consumer
                .as_ref()
                .map(|consumer| consumer.link == link && consumer.tag == consumer_tag)
                .unwrap_or(false);

            if owned {
                requeue_in_flight(state);
                state.consumer = None;
            }
        }
    }

    /// Detaches every consumer owned by the link
    fn release_consumers(&mut self, link: LinkId) {
        for state in self.queues.values_mut() {
            let owned = state
                .consumer
                .as_ref()
                .map(|consumer| consumer.link == link)
                .unwrap_or(false);

            if owned {
                requeue_in_flight(state);
                state.consumer = None;
            }
        }
    }

    fn drop_exclusive_queues(&mut self, link: LinkId) {
        let owned: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, state)| state.exclusive_owner == Some(link))
            .map(|(name, _)| name.clone())
            .collect();

        for queue in owned {
            self.delete_queue(&queue);
        }
    }

    fn delete_queue(&mut self, queue: &str) {
        let Some(state) = self.queues.remove(queue) else {
            return;
        };

        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|binding| binding.queue != queue);
        }

        if let Some(consumer) = state.consumer {
            debug!("Queue '{}' deleted, cancelling consumer '{}'", queue, consumer.tag);
            self.send(
                consumer.link,
                TransportEvent::ConsumerCancelled {
                    consumer_tag: consumer.tag,
                },
            );
        }
    }

    fn drop_link(&mut self, link: LinkId) {
        self.release_consumers(link);
        self.drop_exclusive_queues(link);
        self.links.remove(&link);
    }

    fn close_channel_with_error(
        &mut self,
        link: LinkId,
        channel: ChannelKind,
        code: u16,
        reason: String,
    ) {
        debug!("Closing {} channel of link {}: {} ({})", channel, link, reason, code);

        if let Some(state) = self.links.get_mut(&link) {
            state.channels.remove(&channel);
        }

        if channel == ChannelKind::Input {
            self.release_consumers(link);
        }

        self.send(
            link,
            TransportEvent::ChannelClosed {
                channel,
                code,
                reason,
            },
        );
    }

    fn send(&mut self, link: LinkId, event: TransportEvent) {
        if let Some(state) = self.links.get(&link) {
            if state.events.send(event).is_err() {
                self.drop_link(link);
            }
        }
    }
}

/// Returns unacknowledged deliveries to the front of the queue in delivery order
fn requeue_in_flight(state: &mut QueueState) {
    let Some(consumer) = state.consumer.as_mut() else {
        return;
    };

    let mut tags: Vec<u64> = consumer.in_flight.keys().copied().collect();
    tags.sort_unstable();

    for tag in tags.into_iter().rev() {
        if let Some(message) = consumer.in_flight.remove(&tag) {
            state.ready.push_front(message);
        }
    }
}
