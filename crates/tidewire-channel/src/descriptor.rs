//! Static service descriptions.
//!
//! A [`ServiceDescriptor`] is built once at setup and lists the methods a
//! proxy may call. Each method binds a name to a message type id, its
//! content (and answer) shapes and whether it takes a tag.

use std::any::{TypeId, type_name};
use std::collections::BTreeMap;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tidewire_protocol::{Category, ContentRegistry, ProtocolResult};
use tracing::debug;

use crate::error::{ChannelError, ChannelResult};

/// Whether a method call carries a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagParam {
    /// The method takes a tag argument (which may still be absent per call).
    Declared,
    /// Passing a tag is an error.
    None,
}

/// Method kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    /// Request with an answer.
    Command,
    /// One-way notification.
    Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ShapeRef {
    id: TypeId,
    name: &'static str,
}

impl ShapeRef {
    fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }
}

/// One method of a service.
#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    name: String,
    kind: MethodKind,
    type_id: String,
    tag: TagParam,
    content: ShapeRef,
    answer: Option<ShapeRef>,
}

impl MethodDescriptor {
    /// Method name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Command or event.
    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    /// Message type id on the wire.
    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    /// Tag declaration.
    pub fn tag_param(&self) -> TagParam {
        self.tag
    }

    pub(crate) fn check_call<Req: 'static>(
        &self,
        kind: MethodKind,
        tag: Option<i64>,
    ) -> ChannelResult<()> {
        if self.kind != kind {
            return Err(ChannelError::descriptor(format!(
                "method {} is a {:?}, not a {kind:?}",
                self.name, self.kind
            )));
        }
        if self.content.id != TypeId::of::<Req>() {
            return Err(ChannelError::descriptor(format!(
                "method {} takes {}, got {}",
                self.name,
                self.content.name,
                type_name::<Req>()
            )));
        }
        if tag.is_some() && self.tag == TagParam::None {
            return Err(ChannelError::descriptor(format!(
                "method {} does not take a tag",
                self.name
            )));
        }
        Ok(())
    }

    pub(crate) fn check_answer<Res: 'static>(&self) -> ChannelResult<()> {
        match self.answer {
            Some(answer) if answer.id == TypeId::of::<Res>() => Ok(()),
            Some(answer) => Err(ChannelError::descriptor(format!(
                "method {} answers with {}, not {}",
                self.name,
                answer.name,
                type_name::<Res>()
            ))),
            None => Err(ChannelError::descriptor(format!(
                "method {} has no answer",
                self.name
            ))),
        }
    }
}

type Registration = Box<dyn Fn(&ContentRegistry) -> ProtocolResult<()> + Send + Sync>;

/// Builder for [`ServiceDescriptor`].
pub struct ServiceDescriptorBuilder {
    name: String,
    methods: Vec<(MethodDescriptor, Registration)>,
}

impl ServiceDescriptorBuilder {
    /// Adds a command method with content `C` and answer `A`.
    pub fn command<C, A>(mut self, method: &str, type_id: &str, tag: TagParam) -> Self
    where
        C: Serialize + DeserializeOwned + Default + 'static,
        A: Serialize + DeserializeOwned + Default + 'static,
    {
        let owned = type_id.to_string();
        self.methods.push((
            MethodDescriptor {
                name: method.to_string(),
                kind: MethodKind::Command,
                type_id: type_id.to_string(),
                tag,
                content: ShapeRef::of::<C>(),
                answer: Some(ShapeRef::of::<A>()),
            },
            Box::new(move |registry| {
                registry.register::<C>(Category::Command, &owned)?;
                registry.register::<A>(Category::Answer, &owned)
            }),
        ));
        self
    }

    /// Adds an event method with content `C`.
    pub fn event<C>(mut self, method: &str, type_id: &str, tag: TagParam) -> Self
    where
        C: Serialize + DeserializeOwned + Default + 'static,
    {
        let owned = type_id.to_string();
        self.methods.push((
            MethodDescriptor {
                name: method.to_string(),
                kind: MethodKind::Event,
                type_id: type_id.to_string(),
                tag,
                content: ShapeRef::of::<C>(),
                answer: None,
            },
            Box::new(move |registry| registry.register::<C>(Category::Event, &owned)),
        ));
        self
    }

    /// Validates the methods and registers their shapes.
    pub fn build(self, registry: &ContentRegistry) -> ChannelResult<ServiceDescriptor> {
        let mut methods = BTreeMap::new();
        for (method, registration) in self.methods {
            if method.type_id.is_empty() {
                return Err(ChannelError::descriptor(format!(
                    "method {} of {} has an empty type id",
                    method.name, self.name
                )));
            }
            if methods.contains_key(&method.name) {
                return Err(ChannelError::descriptor(format!(
                    "duplicate method {} in {}",
                    method.name, self.name
                )));
            }
            registration(registry)?;
            methods.insert(method.name.clone(), method);
        }

        debug!(service = %self.name, methods = methods.len(), "Built service descriptor");
        Ok(ServiceDescriptor {
            name: self.name,
            methods,
        })
    }
}

/// Immutable description of a service.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    name: String,
    methods: BTreeMap<String, MethodDescriptor>,
}

impl ServiceDescriptor {
    /// Starts describing a service.
    pub fn builder(name: impl Into<String>) -> ServiceDescriptorBuilder {
        ServiceDescriptorBuilder {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks up a method.
    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.get(name)
    }

    /// Iterates over methods in name order.
    pub fn methods(&self) -> impl Iterator<Item = &MethodDescriptor> {
        self.methods.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Pong {
        n: u32,
        tag: Option<i64>,
    }

    #[test]
    fn build_registers_shapes() {
        let registry = ContentRegistry::new();
        let service = ServiceDescriptor::builder("pinger")
            .command::<Ping, Pong>("ping", "ping", TagParam::Declared)
            .event::<Ping>("poke", "poke", TagParam::None)
            .build(&registry)
            .unwrap();

        assert!(registry.is_shape::<Ping>(Category::Command, "ping"));
        assert!(registry.is_shape::<Pong>(Category::Answer, "ping"));
        assert!(registry.is_shape::<Ping>(Category::Event, "poke"));

        let names: Vec<_> = service.methods().map(MethodDescriptor::name).collect();
        assert_eq!(names, vec!["ping", "poke"]);
        assert_eq!(service.method("poke").unwrap().kind(), MethodKind::Event);
    }

    #[test]
    fn duplicate_method_rejected() {
        let result = ServiceDescriptor::builder("pinger")
            .event::<Ping>("poke", "poke", TagParam::None)
            .event::<Ping>("poke", "poke-again", TagParam::None)
            .build(&ContentRegistry::new());
        assert!(matches!(result, Err(ChannelError::Descriptor(_))));
    }

    #[test]
    fn conflicting_shape_rejected() {
        let registry = ContentRegistry::new();
        registry.register::<Pong>(Category::Event, "poke").unwrap();
        let result = ServiceDescriptor::builder("pinger")
            .event::<Ping>("poke", "poke", TagParam::None)
            .build(&registry);
        assert!(matches!(result, Err(ChannelError::Protocol(_))));
    }

    #[test]
    fn call_checks() {
        let service = ServiceDescriptor::builder("pinger")
            .command::<Ping, Pong>("ping", "ping", TagParam::None)
            .build(&ContentRegistry::new())
            .unwrap();
        let ping = service.method("ping").unwrap();

        assert!(ping.check_call::<Ping>(MethodKind::Command, None).is_ok());
        assert!(ping.check_call::<Ping>(MethodKind::Command, Some(1)).is_err());
        assert!(ping.check_call::<Pong>(MethodKind::Command, None).is_err());
        assert!(ping.check_call::<Ping>(MethodKind::Event, None).is_err());
        assert!(ping.check_answer::<Pong>().is_ok());
        assert!(ping.check_answer::<Ping>().is_err());
    }
}
