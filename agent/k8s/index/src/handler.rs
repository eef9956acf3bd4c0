use crate::{Kind, NamespaceFilter, Notification};
use ahash::AHashSet;
use futures::prelude::*;
use std::marker::PhantomData;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use walden_agent_core::ServiceIdentity;
use walden_agent_k8s_api::{watcher, Resource, ResourceExt};

/// A resource kind that feeds the desired state.
///
/// Implementations describe how a single object of the kind is converted into a [`Notification`];
/// everything else about consuming a watch is shared by [`Handler`].
pub trait Watched: Resource<DynamicType = ()> + Send + 'static {
    const KIND: Kind;

    /// Converts the object's current state into a notification.
    fn applied(self, id: ServiceIdentity) -> Notification;

    fn deleted(id: ServiceIdentity) -> Notification;
}

/// Consumes a single kind's watch, publishing a [`Notification`] per accepted event.
///
/// The handler remembers which objects it has published so that objects which disappear while a
/// watch is being re-established are deleted once the new initial listing completes.
#[derive(Debug)]
pub struct Handler<T> {
    filter: NamespaceFilter,
    tx: mpsc::UnboundedSender<Notification>,

    /// Identities published and not yet deleted.
    known: AHashSet<ServiceIdentity>,

    /// Identities seen during an in-progress initial listing.
    listing: Option<AHashSet<ServiceIdentity>>,

    _kind: PhantomData<fn(T)>,
}

#[derive(Debug, thiserror::Error)]
#[error("notification queue closed")]
pub struct Closed(());

// === impl Handler ===

impl<T: Watched> Handler<T> {
    pub fn new(filter: NamespaceFilter, tx: mpsc::UnboundedSender<Notification>) -> Self {
        Self {
            filter,
            tx,
            known: AHashSet::new(),
            listing: None,
            _kind: PhantomData,
        }
    }

    /// Processes events until the stream ends, the token is cancelled, or the queue's consumer
    /// goes away.
    pub async fn run<S>(mut self, events: S, shutdown: CancellationToken)
    where
        S: Stream<Item = watcher::Event<T>>,
    {
        tokio::pin!(events);
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("Shutdown");
                    return;
                }
                event = events.next() => match event {
                    Some(event) => event,
                    None => {
                        debug!("Watch ended");
                        return;
                    }
                },
            };

            if self.handle(event).is_err() {
                debug!("Notification queue closed");
                return;
            }
        }
    }

    pub fn handle(&mut self, event: watcher::Event<T>) -> Result<(), Closed> {
        match event {
            watcher::Event::Init => {
                debug!(kind = %T::KIND, "Listing");
                self.listing = Some(AHashSet::new());
                Ok(())
            }

            watcher::Event::InitApply(obj) => {
                let Some(id) = self.accept(&obj) else {
                    return Ok(());
                };
                if let Some(listing) = self.listing.as_mut() {
                    listing.insert(id.clone());
                }
                self.apply(id, obj)
            }

            watcher::Event::InitDone => {
                // Anything we published before the watch restarted but that wasn't part of the new
                // listing was deleted while we weren't watching.
                if let Some(listing) = self.listing.take() {
                    let mut removed = self
                        .known
                        .iter()
                        .filter(|id| !listing.contains(*id))
                        .cloned()
                        .collect::<Vec<_>>();
                    removed.sort();
                    for id in removed {
                        self.delete(id)?;
                    }
                }
                debug!(kind = %T::KIND, known = self.known.len(), "Listed");
                self.send(Notification::Synced(T::KIND))
            }

            watcher::Event::Apply(obj) => match self.accept(&obj) {
                Some(id) => self.apply(id, obj),
                None => Ok(()),
            },

            watcher::Event::Delete(obj) => match self.accept(&obj) {
                Some(id) => self.delete(id),
                None => Ok(()),
            },
        }
    }

    fn accept(&self, obj: &T) -> Option<ServiceIdentity> {
        let name = obj.name_any();
        let Some(namespace) = obj.namespace() else {
            warn!(kind = %T::KIND, %name, "Ignoring object without a namespace");
            return None;
        };
        if !self.filter.accept(&namespace) {
            trace!(kind = %T::KIND, %namespace, %name, "Ignoring object outside of scope");
            return None;
        }
        Some(ServiceIdentity { namespace, name })
    }

    fn apply(&mut self, id: ServiceIdentity, obj: T) -> Result<(), Closed> {
        trace!(kind = %T::KIND, %id, "Applied");
        self.known.insert(id.clone());
        self.send(obj.applied(id))
    }

    fn delete(&mut self, id: ServiceIdentity) -> Result<(), Closed> {
        trace!(kind = %T::KIND, %id, "Deleted");
        self.known.remove(&id);
        self.send(T::deleted(id))
    }

    fn send(&self, notification: Notification) -> Result<(), Closed> {
        self.tx.send(notification).map_err(|_| Closed(()))
    }
}
