//! Listener capabilities and listener-type descriptors
//!
//! A listener-type is the identity under which listeners are registered and
//! looked up. In practice it is a trait object type such as
//! `dyn UserListener`, described once by a [`ListenerDescriptor`] that fixes
//! its [`ListenerKind`].
//!
//! ```rust,ignore
//! use armature_listeners::*;
//!
//! trait UserListener: Listener {
//!     fn user_added(&self, event: &UserEvent) -> bool;
//!     fn user_removed(&self, event: &UserEvent);
//! }
//!
//! listener_type!(dyn UserListener => Mixed {
//!     user_added -> bool,
//!     user_removed -> (),
//! });
//! ```

use crate::error::{BoxError, InvocationError, ListenerError, Result};
use crate::event::RegistrationEvent;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Base capability of every listener.
///
/// Listener-type traits extend this trait. Both hooks are called by the
/// listener store after the listener has been added or removed.
pub trait Listener: Send + Sync + 'static {
    fn on_register(&self, _event: &RegistrationEvent) {}

    fn on_unregister(&self, _event: &RegistrationEvent) {}
}

/// Classification of a listener-type, fixed by its descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerKind {
    /// Every method returns nothing.
    #[default]
    Normal,
    /// Every method returns `bool`; `true` stops further notification.
    Abortable,
    /// Methods may return either nothing or `bool`.
    Mixed,
    /// Pure marker without callback methods.
    Tagging,
}

impl ListenerKind {
    /// Whether a `true` result from a method aborts the current dispatch.
    pub fn honours_abort(self) -> bool {
        matches!(self, ListenerKind::Abortable | ListenerKind::Mixed)
    }

    /// Whether a method with the given return shape may be declared.
    pub fn permits(self, shape: ReturnShape) -> bool {
        match self {
            ListenerKind::Normal => shape == ReturnShape::Unit,
            ListenerKind::Abortable => shape == ReturnShape::Abort,
            ListenerKind::Mixed => true,
            ListenerKind::Tagging => false,
        }
    }
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ListenerKind::Normal => "normal",
            ListenerKind::Abortable => "abortable",
            ListenerKind::Mixed => "mixed",
            ListenerKind::Tagging => "tagging",
        };
        f.write_str(name)
    }
}

/// Return shape of a notification method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnShape {
    /// Returns nothing (`()`).
    Unit,
    /// Returns an abort signal (`bool`).
    Abort,
}

/// One declared notification method of a listener-type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodShape {
    pub name: &'static str,
    pub returns: ReturnShape,
}

/// Static description of a listener-type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerDescriptor {
    pub name: &'static str,
    pub kind: ListenerKind,
    pub methods: &'static [MethodShape],
}

impl ListenerDescriptor {
    /// Check that the declared methods fit the declared kind.
    pub fn validate(&self) -> Result<()> {
        if self.kind == ListenerKind::Tagging {
            if !self.methods.is_empty() {
                return Err(ListenerError::InvalidArgument(format!(
                    "listener type `{}` is tagging and must be empty, found {} method(s)",
                    self.name,
                    self.methods.len()
                )));
            }
            return Ok(());
        }

        for method in self.methods {
            if !self.kind.permits(method.returns) {
                let expected = match self.kind {
                    ListenerKind::Abortable => "bool",
                    _ => "()",
                };
                return Err(ListenerError::InvalidArgument(format!(
                    "method `{}` of {} listener type `{}` must return {}",
                    method.name, self.kind, self.name, expected
                )));
            }
        }
        Ok(())
    }
}

/// Identity and description of a listener-type.
///
/// Implement it with [`listener_type!`](crate::listener_type) for a trait
/// object type, or by hand for a concrete listener type.
pub trait ListenerType: Listener {
    const DESCRIPTOR: ListenerDescriptor;
}

/// Result of a bound notification method.
///
/// Implemented for `()` (never aborts), `bool` (abort signal) and
/// `Result<T, E>` where an `Err` is reported as a failed invocation.
pub trait NotificationResult: 'static {
    const SHAPE: ReturnShape;

    /// `Ok(true)` when the listener asked to stop notifying.
    fn into_abort(self) -> std::result::Result<bool, InvocationError>;
}

impl NotificationResult for () {
    const SHAPE: ReturnShape = ReturnShape::Unit;

    fn into_abort(self) -> std::result::Result<bool, InvocationError> {
        Ok(false)
    }
}

impl NotificationResult for bool {
    const SHAPE: ReturnShape = ReturnShape::Abort;

    fn into_abort(self) -> std::result::Result<bool, InvocationError> {
        Ok(self)
    }
}

impl<T, E> NotificationResult for std::result::Result<T, E>
where
    T: NotificationResult,
    E: Into<BoxError> + 'static,
{
    const SHAPE: ReturnShape = T::SHAPE;

    fn into_abort(self) -> std::result::Result<bool, InvocationError> {
        match self {
            Ok(value) => value.into_abort(),
            Err(err) => Err(InvocationError::Failed(err.into())),
        }
    }
}

/// Declare a listener-type and its method shapes.
///
/// ```rust,ignore
/// listener_type!(dyn StatusListener => Abortable { status_changed -> bool });
/// listener_type!(dyn Marker => Tagging {});
/// ```
#[macro_export]
macro_rules! listener_type {
    ($ty:ty => $kind:ident { $($method:ident -> $ret:ty),* $(,)? }) => {
        impl $crate::ListenerType for $ty {
            const DESCRIPTOR: $crate::ListenerDescriptor = $crate::ListenerDescriptor {
                name: stringify!($ty),
                kind: $crate::ListenerKind::$kind,
                methods: &[$(
                    $crate::MethodShape {
                        name: stringify!($method),
                        returns: <$ret as $crate::NotificationResult>::SHAPE,
                    }
                ),*],
            };
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    const NORMAL_WITH_BOOL: ListenerDescriptor = ListenerDescriptor {
        name: "dyn Broken",
        kind: ListenerKind::Normal,
        methods: &[
            MethodShape {
                name: "fine",
                returns: ReturnShape::Unit,
            },
            MethodShape {
                name: "bad",
                returns: ReturnShape::Abort,
            },
        ],
    };

    #[test]
    fn test_kind_abort_semantics() {
        assert!(!ListenerKind::Normal.honours_abort());
        assert!(ListenerKind::Abortable.honours_abort());
        assert!(ListenerKind::Mixed.honours_abort());
        assert!(!ListenerKind::Tagging.honours_abort());

        assert!(ListenerKind::Mixed.permits(ReturnShape::Unit));
        assert!(ListenerKind::Mixed.permits(ReturnShape::Abort));
        assert!(!ListenerKind::Tagging.permits(ReturnShape::Unit));
    }

    #[test]
    fn test_normal_rejects_bool_method() {
        let err = NORMAL_WITH_BOOL.validate().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("must return"));
        assert!(message.contains("bad"));
    }

    #[test]
    fn test_abortable_rejects_unit_method() {
        let descriptor = ListenerDescriptor {
            name: "dyn Stopper",
            kind: ListenerKind::Abortable,
            methods: &[MethodShape {
                name: "stop",
                returns: ReturnShape::Unit,
            }],
        };
        let message = descriptor.validate().unwrap_err().to_string();
        assert!(message.contains("must return bool"));
    }

    #[test]
    fn test_tagging_must_be_empty() {
        let descriptor = ListenerDescriptor {
            name: "dyn Marker",
            kind: ListenerKind::Tagging,
            methods: &[MethodShape {
                name: "oops",
                returns: ReturnShape::Unit,
            }],
        };
        assert!(descriptor.validate().unwrap_err().to_string().contains("must be empty"));

        let empty = ListenerDescriptor {
            methods: &[],
            ..descriptor
        };
        assert!(empty.validate().is_ok());
    }

    #[test]
    fn test_result_shapes() {
        assert_eq!(<() as NotificationResult>::SHAPE, ReturnShape::Unit);
        assert_eq!(<bool as NotificationResult>::SHAPE, ReturnShape::Abort);
        assert_eq!(
            <std::result::Result<bool, std::io::Error> as NotificationResult>::SHAPE,
            ReturnShape::Abort
        );

        let failed: std::result::Result<(), std::io::Error> = Err(std::io::Error::other("nope"));
        assert!(matches!(failed.into_abort(), Err(InvocationError::Failed(_))));
        assert!(matches!(true.into_abort(), Ok(true)));
    }

    #[test]
    fn test_kind_serde_names() {
        let json = serde_json::to_string(&ListenerKind::Abortable).unwrap();
        assert_eq!(json, "\"abortable\"");
        let kind: ListenerKind = serde_json::from_str("\"tagging\"").unwrap();
        assert_eq!(kind, ListenerKind::Tagging);
    }
}
