use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use tracing::error;

use crate::raw::conn::ConnectionConfig;
use crate::raw::operation::{Operation, OperationArgs, OperationKind};
use crate::raw::request::Request;
use crate::Errno;

/// A handler for one operation kind. It receives the user data given to the
/// session, the request handle to complete and the decoded arguments.
pub type Handler<U> = Arc<dyn Fn(&Arc<U>, Request, Operation) + Send + Sync>;

/// Called once during the handshake; may adjust the connection parameters or
/// refuse the connection.
pub type InitHandler<U> =
    Arc<dyn Fn(&Arc<U>, &mut ConnectionConfig) -> crate::Result<()> + Send + Sync>;

/// Called once when the session winds down. There is no request to answer.
pub type DestroyHandler<U> = Arc<dyn Fn(&Arc<U>) + Send + Sync>;

/// The operations a filesystem implements.
///
/// The table is filled before the session starts and is read only after
/// that. Operations without a handler are answered with `ENOSYS`.
pub struct OperationTable<U> {
    handlers: Vec<Option<Handler<U>>>,
    init: Option<InitHandler<U>>,
    destroy: Option<DestroyHandler<U>>,
}

impl<U: Send + Sync + 'static> OperationTable<U> {
    pub fn new() -> Self {
        Self {
            handlers: vec![None; OperationKind::COUNT],
            init: None,
            destroy: None,
        }
    }

    /// Install or replace the handler for `kind`.
    ///
    /// # Panics
    ///
    /// `Init` and `Destroy` have no request handle; use
    /// [`on_init`][Self::on_init] and [`on_destroy`][Self::on_destroy].
    pub fn register<F>(&mut self, kind: OperationKind, handler: F) -> &mut Self
    where
        F: Fn(&Arc<U>, Request, Operation) + Send + Sync + 'static,
    {
        assert!(
            !matches!(kind, OperationKind::Init | OperationKind::Destroy),
            "{kind} carries no request, register it with on_init/on_destroy"
        );

        self.handlers[kind.index()] = Some(Arc::new(handler));
        self
    }

    /// Install a handler that receives the arguments of `A` directly.
    pub fn on<A, F>(&mut self, handler: F) -> &mut Self
    where
        A: OperationArgs,
        F: Fn(&Arc<U>, Request, A) + Send + Sync + 'static,
    {
        self.register(A::KIND, move |user, req, operation| {
            match A::from_operation(operation) {
                Ok(args) => handler(user, req, args),
                Err(operation) => {
                    error!("{} request routed to the {} handler", operation.kind(), A::KIND);
                    req.reply_err(Errno::from(libc::EIO));
                }
            }
        })
    }

    pub fn on_init<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&Arc<U>, &mut ConnectionConfig) -> crate::Result<()> + Send + Sync + 'static,
    {
        self.init = Some(Arc::new(handler));
        self
    }

    pub fn on_destroy<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&Arc<U>) + Send + Sync + 'static,
    {
        self.destroy = Some(Arc::new(handler));
        self
    }
}

impl<U> OperationTable<U> {
    /// The handler for `kind`, if one is registered. Always `None` for
    /// `Init` and `Destroy`.
    pub fn resolve(&self, kind: OperationKind) -> Option<&Handler<U>> {
        self.handlers[kind.index()].as_ref()
    }

    pub fn is_registered(&self, kind: OperationKind) -> bool {
        match kind {
            OperationKind::Init => self.init.is_some(),
            OperationKind::Destroy => self.destroy.is_some(),
            kind => self.handlers[kind.index()].is_some(),
        }
    }

    pub(crate) fn init_handler(&self) -> Option<&InitHandler<U>> {
        self.init.as_ref()
    }

    pub(crate) fn destroy_handler(&self) -> Option<&DestroyHandler<U>> {
        self.destroy.as_ref()
    }
}

impl<U: Send + Sync + 'static> Default for OperationTable<U> {
    fn default() -> Self {
        Self::new()
    }
}

impl<U> Debug for OperationTable<U> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let registered: Vec<_> = OperationKind::ALL
            .into_iter()
            .filter(|kind| self.is_registered(*kind))
            .map(OperationKind::name)
            .collect();

        f.debug_struct("OperationTable")
            .field("registered", &registered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::op;

    #[test]
    fn unset_slots_resolve_to_none() {
        let table = OperationTable::<()>::new();
        for kind in OperationKind::ALL {
            assert!(table.resolve(kind).is_none());
            assert!(!table.is_registered(kind));
        }
    }

    #[test]
    fn register_and_replace() {
        let mut table = OperationTable::<()>::new();
        table
            .on::<op::Lookup, _>(|_, req, _| req.reply_err(Errno::new_not_exist()))
            .on_init(|_, _| Ok(()))
            .on_destroy(|_| {});

        assert!(table.is_registered(OperationKind::Lookup));
        assert!(table.is_registered(OperationKind::Init));
        assert!(table.is_registered(OperationKind::Destroy));
        assert!(table.resolve(OperationKind::Init).is_none());

        let first = table.resolve(OperationKind::Lookup).cloned().unwrap();
        table.register(OperationKind::Lookup, |_, req, _| req.reply_err(Errno::new_exist()));
        let second = table.resolve(OperationKind::Lookup).unwrap();
        assert!(!Arc::ptr_eq(&first, second));
    }

    #[test]
    #[should_panic(expected = "on_init")]
    fn init_cannot_be_registered_generically() {
        OperationTable::<()>::new().register(OperationKind::Init, |_, _, _| {});
    }
}
