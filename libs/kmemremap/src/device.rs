// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::{Error, NodeId};

/// Identifies a resource bound to a [`Device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(usize);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct DevresEntry {
    id: ResourceId,
    name: &'static str,
    released: Arc<AtomicBool>,
    release: Box<dyn FnOnce() + Send>,
}

impl DevresEntry {
    fn run(self, device: &str) {
        log::trace!("{device}: releasing {} {}", self.name, self.id);

        // handles must observe the release before the resource is torn down
        self.released.store(true, Ordering::Release);
        (self.release)();
    }
}

/// The owner of device-managed resources.
///
/// Resources are bound through [`Device::bind`] and released in reverse order of binding when the
/// device is [detached][Device::detach] or dropped, whichever comes first. Each release action runs
/// exactly once.
pub struct Device<R: lock_api::RawMutex> {
    name: String,
    node: Option<NodeId>,
    next_id: AtomicUsize,
    resources: lock_api::Mutex<R, Vec<DevresEntry>>,
}

impl<R: lock_api::RawMutex> fmt::Debug for Device<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("node", &self.node)
            .field("next_id", &self.next_id)
            .field(
                "resources",
                &self.resources.try_lock().map(|resources| resources.len()),
            )
            .finish()
    }
}

impl<R: lock_api::RawMutex> Device<R> {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            node: None,
            next_id: AtomicUsize::new(0),
            resources: lock_api::Mutex::new(Vec::new()),
        })
    }

    /// Creates a device with an affinity to the NUMA node `node`.
    pub fn with_node(name: impl Into<String>, node: NodeId) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            node: Some(node),
            next_id: AtomicUsize::new(0),
            resources: lock_api::Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn node(&self) -> Option<NodeId> {
        self.node
    }

    /// The number of resources currently bound to this device.
    pub fn resources(&self) -> usize {
        self.resources.lock().len()
    }

    /// Binds a resource to the lifetime of this device.
    ///
    /// `construct` produces the resource. If it succeeds, `release` is registered to run when the
    /// device is detached or the returned handle is [released][Devres::release], whichever happens
    /// first. If it fails nothing is bound and the error is returned as-is.
    ///
    /// The returned handle shares the resource with the release action but never hands out
    /// ownership of it, so `release` is the only place that can consume it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`] if tracking storage could not be allocated, or the error
    /// returned by `construct`.
    pub fn bind<T, C, D>(
        self: &Arc<Self>,
        name: &'static str,
        construct: C,
        release: D,
    ) -> crate::Result<Devres<R, T>>
    where
        T: Send + Sync + 'static,
        C: FnOnce() -> crate::Result<Arc<T>>,
        D: FnOnce(Arc<T>) + Send + 'static,
    {
        // fail early, before anything is constructed
        self.resources
            .lock()
            .try_reserve(1)
            .map_err(|_| Error::ResourceExhausted)?;

        let value = construct()?;

        let id = ResourceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let released = Arc::new(AtomicBool::new(false));
        let tracked = Arc::clone(&value);
        let entry = DevresEntry {
            id,
            name,
            released: Arc::clone(&released),
            release: Box::new(move || release(tracked)),
        };

        {
            let mut resources = self.resources.lock();
            // a concurrent bind may have used up the reservation made above
            if resources.try_reserve(1).is_ok() {
                resources.push(entry);
            } else {
                drop(resources);
                log::warn!("{}: no space to track {name}, releasing it again", self.name);
                entry.run(&self.name);
                return Err(Error::ResourceExhausted);
            }
        }

        log::trace!("{}: bound {name} {id}", self.name);

        Ok(Devres {
            device: Arc::clone(self),
            id,
            released,
            value,
        })
    }

    /// Releases the resource `id` now instead of when the device is detached.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotBound`] if no resource with this id is bound, for example because it was
    /// already released.
    pub fn release(&self, id: ResourceId) -> crate::Result<()> {
        let entry = {
            let mut resources = self.resources.lock();
            let pos = resources
                .iter()
                .position(|entry| entry.id == id)
                .ok_or_else(|| Error::NotBound {
                    device: self.name.clone(),
                    id,
                })?;
            resources.remove(pos)
        };

        entry.run(&self.name);

        Ok(())
    }

    /// Releases every resource bound to this device, most recently bound first.
    ///
    /// Release actions run without holding the device lock, so they may bind or release resources
    /// of other devices. Resources bound to this device while detaching are released too.
    pub fn detach(&self) {
        loop {
            let Some(entry) = self.resources.lock().pop() else {
                break;
            };

            entry.run(&self.name);
        }

        log::debug!("{}: detached", self.name);
    }
}

impl<R: lock_api::RawMutex> Drop for Device<R> {
    fn drop(&mut self) {
        let resources = core::mem::take(self.resources.get_mut());

        for entry in resources.into_iter().rev() {
            entry.run(&self.name);
        }
    }
}

/// A handle to a resource bound to a [`Device`].
///
/// Dropping the handle does not release the resource, it stays alive until the device is detached
/// or [`release`][Devres::release] is called. Once released the handle no longer gives access to
/// the resource.
pub struct Devres<R: lock_api::RawMutex, T> {
    device: Arc<Device<R>>,
    id: ResourceId,
    released: Arc<AtomicBool>,
    value: Arc<T>,
}

impl<R: lock_api::RawMutex, T: fmt::Debug> fmt::Debug for Devres<R, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Devres")
            .field("device", &self.device.name)
            .field("id", &self.id)
            .field("released", &self.is_released())
            .field("value", &self.value)
            .finish()
    }
}

impl<R: lock_api::RawMutex, T> Devres<R, T> {
    pub const fn id(&self) -> ResourceId {
        self.id
    }

    /// The device this resource is bound to.
    pub fn owner(&self) -> &Arc<Device<R>> {
        &self.device
    }

    /// Whether the resource was released, either explicitly or by detaching its device.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Returns the resource.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotBound`] if the resource was released.
    pub fn get(&self) -> crate::Result<&T> {
        if self.is_released() {
            return Err(Error::NotBound {
                device: self.device.name.clone(),
                id: self.id,
            });
        }

        Ok(&self.value)
    }

    /// Releases the resource before the device is detached.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotBound`] if the resource was already released.
    pub fn release(&self) -> crate::Result<()> {
        self.device.release(self.id)
    }
}
