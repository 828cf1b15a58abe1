//! Inbound command/event routing.
//!
//! The dispatcher maps `(category, type_id)` to a [`Handler`] and turns the
//! handler's outcome into an answer envelope for commands. Nothing a
//! handler does (error or panic) escapes `dispatch`; events never produce
//! an answer.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::FutureExt;
use futures_util::future::{self, BoxFuture};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tidewire_protocol::{Category, ContentRegistry, Envelope, ErrorPayload, ProtocolError, codes};
use tracing::{debug, error, warn};

use crate::error::{ChannelError, ChannelResult};

/// Result of a handler invocation: the encoded answer payload or an error
/// payload for the peer.
pub type HandlerResult = Result<Value, ErrorPayload>;

/// Type-erased handler for one message type.
pub trait Handler: Send + Sync + 'static {
    /// Handles one message with its tag and raw payload.
    fn call(&self, tag: Option<i64>, payload: Value) -> BoxFuture<'static, HandlerResult>;
}

impl<F> Handler for F
where
    F: Fn(Option<i64>, Value) -> BoxFuture<'static, HandlerResult> + Send + Sync + 'static,
{
    fn call(&self, tag: Option<i64>, payload: Value) -> BoxFuture<'static, HandlerResult> {
        self(tag, payload)
    }
}

type HandlerKey = (Category, String);

/// Routes inbound commands and events to registered handlers.
pub struct Dispatcher {
    registry: Arc<ContentRegistry>,
    handlers: RwLock<HashMap<HandlerKey, Arc<dyn Handler>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.registered())
            .finish()
    }
}

impl Dispatcher {
    /// Creates an empty dispatcher decoding with `registry`.
    pub fn new(registry: Arc<ContentRegistry>) -> Self {
        Self {
            registry,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the content registry.
    pub fn registry(&self) -> &Arc<ContentRegistry> {
        &self.registry
    }

    /// Registers a raw handler.
    pub fn register(
        &self,
        category: Category,
        type_id: &str,
        handler: Arc<dyn Handler>,
    ) -> ChannelResult<()> {
        if category == Category::Answer {
            return Err(ChannelError::descriptor(format!(
                "cannot register a handler for answers ({type_id})"
            )));
        }

        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let key = (category, type_id.to_string());
        if handlers.contains_key(&key) {
            return Err(ChannelError::DuplicateHandler {
                category,
                type_id: type_id.to_string(),
            });
        }
        handlers.insert(key, handler);
        debug!(?category, type_id, "Registered handler");
        Ok(())
    }

    /// Registers a typed command handler.
    ///
    /// `C` is registered as the command shape and `A` as the answer shape.
    pub fn on_command<C, A, F, Fut>(&self, type_id: &str, handler: F) -> ChannelResult<()>
    where
        C: Serialize + DeserializeOwned + Default + Send + 'static,
        A: Serialize + DeserializeOwned + Default + Send + 'static,
        F: Fn(Option<i64>, C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<A, ErrorPayload>> + Send + 'static,
    {
        self.registry.register::<C>(Category::Command, type_id)?;
        self.registry.register::<A>(Category::Answer, type_id)?;

        let registry = Arc::clone(&self.registry);
        let owned_type_id = type_id.to_string();
        let erased = move |tag: Option<i64>, payload: Value| -> BoxFuture<'static, HandlerResult> {
            let content = match registry.decode::<C>(Category::Command, &owned_type_id, payload) {
                Ok(content) => content,
                Err(e) => return future::ready(Err(decode_failure(&e))).boxed(),
            };
            let answer = handler(tag, content);
            let registry = Arc::clone(&registry);
            async move {
                let answer = answer.await?;
                registry
                    .encode(&answer)
                    .map_err(|e| ErrorPayload::engine(codes::INTERNAL_ERROR, e.to_string()))
            }
            .boxed()
        };
        self.register(Category::Command, type_id, Arc::new(erased))
    }

    /// Registers a typed event handler.
    pub fn on_event<C, F, Fut>(&self, type_id: &str, handler: F) -> ChannelResult<()>
    where
        C: Serialize + DeserializeOwned + Default + Send + 'static,
        F: Fn(Option<i64>, C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ErrorPayload>> + Send + 'static,
    {
        self.registry.register::<C>(Category::Event, type_id)?;

        let registry = Arc::clone(&self.registry);
        let owned_type_id = type_id.to_string();
        let erased = move |tag: Option<i64>, payload: Value| -> BoxFuture<'static, HandlerResult> {
            match registry.decode::<C>(Category::Event, &owned_type_id, payload) {
                Ok(content) => handler(tag, content).map(|r| r.map(|()| Value::Null)).boxed(),
                Err(e) => future::ready(Err(decode_failure(&e))).boxed(),
            }
        };
        self.register(Category::Event, type_id, Arc::new(erased))
    }

    /// Returns true if a handler is registered for the key.
    pub fn has_handler(&self, category: Category, type_id: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&(category, type_id.to_string()))
    }

    /// Returns the registered keys, sorted.
    pub fn registered(&self) -> Vec<(Category, String)> {
        let mut keys: Vec<_> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Runs the handler for an inbound command or event.
    ///
    /// Returns the answer to send for commands, `None` for events.
    #[tracing::instrument(
        skip(self, envelope),
        fields(
            category = ?envelope.category,
            type_id = %envelope.type_id,
            correlation_id = ?envelope.correlation_id,
        )
    )]
    pub async fn dispatch(&self, envelope: Envelope) -> Option<Envelope> {
        if envelope.is_answer() {
            warn!("Answers are not dispatched");
            return None;
        }

        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(envelope.category, envelope.type_id.clone()))
            .cloned();

        let Some(handler) = handler else {
            let missing = ChannelError::HandlerNotFound {
                category: envelope.category,
                type_id: envelope.type_id.clone(),
            };
            warn!(error = %missing, "Dropping message without handler");
            return envelope.is_command().then(|| {
                Envelope::failure_to(
                    &envelope,
                    &ErrorPayload::engine(codes::HANDLER_NOT_FOUND, missing.to_string()),
                )
            });
        };

        let tag = envelope.tag;
        let payload = envelope.payload.clone();
        let outcome = AssertUnwindSafe(async move { handler.call(tag, payload).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!("Handler panicked");
                Err(ErrorPayload::engine(
                    codes::HANDLER_FAILED,
                    format!("handler for {} panicked", envelope.type_id),
                ))
            });

        if envelope.is_event() {
            if let Err(e) = outcome {
                warn!(error = %e, "Event handler failed");
            }
            return None;
        }

        Some(match outcome {
            Ok(mut payload) => {
                self.registry.apply_tag(
                    Category::Answer,
                    &envelope.type_id,
                    &mut payload,
                    envelope.tag,
                    false,
                );
                Envelope::answer_to(&envelope, payload)
            }
            Err(e) => {
                debug!(error = %e, "Command handler returned an error");
                Envelope::failure_to(&envelope, &e)
            }
        })
    }
}

/// Error payload for inbound content the registry could not decode.
fn decode_failure(error: &ProtocolError) -> ErrorPayload {
    let code = match error {
        ProtocolError::UnknownType { .. } => codes::UNKNOWN_TYPE,
        _ => codes::DECODE_ERROR,
    };
    ErrorPayload::engine(code, error.to_string())
}
