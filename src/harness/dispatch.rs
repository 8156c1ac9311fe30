//! Consumer-side dispatch loop classifying handler outcomes

use super::session::BrokerSession;
use super::{SessionError, StopRequest};
use crate::library::communication::message::InboundMessage;
use crate::library::communication::transport::Transport;
use crate::library::BoxedError;
use async_trait::async_trait;
use log::warn;
use std::error::Error;
use thiserror::Error;
use tokio::sync::watch;

/// Identifiers tying an error back to the record that caused it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordContext {
    /// Identifier of the offending input record
    pub record_id: Option<String>,
    /// Identifier of the event derived from the record, if one was built
    pub event_id: Option<String>,
}

/// Error carrying a [`RecordContext`] through arbitrary re-wrapping
#[derive(Debug, Error)]
#[error("{source}")]
pub struct ContextualError {
    context: RecordContext,
    #[source]
    source: BoxedError,
}

/// Attaches diagnostic context to an error unless some layer already did
///
/// The first attachment wins so the context closest to the failing record
/// survives any amount of later wrapping.
pub fn attach_context(error: BoxedError, context: RecordContext) -> BoxedError {
    if find_context(error.as_ref()).is_some() {
        return error;
    }

    Box::new(ContextualError { context, source: error })
}

/// Walks the source chain looking for an attached [`RecordContext`]
pub fn find_context(error: &(dyn Error + 'static)) -> Option<&RecordContext> {
    let mut current = Some(error);

    while let Some(inner) = current {
        if let Some(contextual) = inner.downcast_ref::<ContextualError>() {
            return Some(&contextual.context);
        }

        current = inner.source();
    }

    None
}

/// Verdict a handler reaches about one inbound message
#[derive(Debug)]
pub enum ConsumeError {
    /// The message is bad, send it to the dead-letter queue and move on
    Rejected(BoxedError),
    /// Something disruptive happened, requeue the message and shut down
    Aborted(BoxedError),
}

/// Failure that ended a dispatch loop
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A handler requested the component to terminate
    #[error("message handling was aborted")]
    Aborted(#[source] BoxedError),

    /// The underlying session failed
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Business logic invoked once per inbound message
#[async_trait]
pub trait MessageHandler: Send {
    /// Processes a single delivery
    async fn handle(&mut self, message: &InboundMessage) -> Result<(), ConsumeError>;
}

/// Pulls deliveries from a session and settles them based on the handler
///
/// Successfully handled messages are acknowledged. Rejected ones travel to
/// the dead-letter queue without requeueing. An abort requeues the message
/// so a future instance gets another attempt, then tears the loop down.
pub struct Dispatcher<H: MessageHandler> {
    handler: H,
}

impl<H: MessageHandler> Dispatcher<H> {
    /// Creates a dispatcher around the given handler
    pub fn new(handler: H) -> Self {
        Self { handler }
    }

    /// Consumes deliveries until a stop is requested or a handler aborts
    pub async fn run<T: Transport + Send>(
        &mut self,
        session: &mut BrokerSession<T>,
        stop: &mut watch::Receiver<StopRequest>,
    ) -> Result<(), DispatchError> {
        loop {
            if *stop.borrow() != StopRequest::None {
                return Ok(());
            }

            tokio::select! {
                biased;

                changed = stop.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                delivery = session.recv() => {
                    let message = delivery?;
                    self.dispatch(session, message).await?;
                }
            }
        }
    }

    /// Hands the dispatcher's handler back
    pub fn into_inner(self) -> H {
        self.handler
    }

    async fn dispatch<T: Transport + Send>(
        &mut self,
        session: &mut BrokerSession<T>,
        message: InboundMessage,
    ) -> Result<(), DispatchError> {
        match self.handler.handle(&message).await {
            Ok(()) => session.ack(message.delivery_tag).await?,
            Err(ConsumeError::Rejected(error)) => {
                match find_context(error.as_ref()) {
                    Some(context) => warn!(
                        "Rejecting delivery '{}' (record {:?}, event {:?}): {}",
                        message.routing_key, context.record_id, context.event_id, error
                    ),
                    None => warn!("Rejecting delivery '{}': {}", message.routing_key, error),
                }

                session.reject(message.delivery_tag, false).await?;
            }
            Err(ConsumeError::Aborted(error)) => {
                session.reject(message.delivery_tag, true).await?;
                return Err(DispatchError::Aborted(error));
            }
        }

        Ok(())
    }
}
