//! In-process transport.
//!
//! Every bound endpoint is a bounded crossbeam channel. A full channel is
//! backpressure, a dropped subscription is a closed destination, and an
//! endpoint can be disconnected and reconnected to simulate network loss.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use super::substrate::{OfferOutcome, Publication, Subscription, Transport, TransportError};

/// First port handed out for endpoints bound with port 0.
const EPHEMERAL_PORT_START: u32 = 40_000;

struct EndpointSlot {
    tx: Sender<Vec<u8>>,
    /// False once the bound subscription is dropped.
    open: Arc<AtomicBool>,
}

/// Endpoint registry shared by every node and client in the process.
#[derive(Clone)]
pub struct InMemoryNetwork {
    endpoints: Arc<RwLock<HashMap<String, EndpointSlot>>>,
    /// Connection flag per endpoint. Survives rebinding.
    connections: Arc<RwLock<HashMap<String, Arc<AtomicBool>>>>,
    next_port: Arc<AtomicU32>,
}

impl Default for InMemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        InMemoryNetwork {
            endpoints: Arc::new(RwLock::new(HashMap::new())),
            connections: Arc::new(RwLock::new(HashMap::new())),
            next_port: Arc::new(AtomicU32::new(EPHEMERAL_PORT_START)),
        }
    }

    fn connection_flag(&self, endpoint: &str) -> Arc<AtomicBool> {
        if let Some(flag) = read(&self.connections).get(endpoint) {
            return flag.clone();
        }
        write(&self.connections)
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(true)))
            .clone()
    }

    /// Stop delivering to `endpoint`. Offers report `NotConnected`.
    pub fn disconnect(&self, endpoint: &str) {
        self.connection_flag(endpoint).store(false, Ordering::SeqCst);
    }

    /// Resume delivering to `endpoint`.
    pub fn reconnect(&self, endpoint: &str) {
        self.connection_flag(endpoint).store(true, Ordering::SeqCst);
    }

    pub fn is_connected(&self, endpoint: &str) -> bool {
        read(&self.connections)
            .get(endpoint)
            .map(|f| f.load(Ordering::SeqCst))
            .unwrap_or(true)
    }

    /// True while a live subscription is bound at `endpoint`.
    pub fn is_bound(&self, endpoint: &str) -> bool {
        read(&self.endpoints)
            .get(endpoint)
            .map(|slot| slot.open.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn resolve(&self, endpoint: &str) -> Result<String, TransportError> {
        let (host, port) = endpoint
            .rsplit_once(':')
            .ok_or_else(|| TransportError::InvalidEndpoint(endpoint.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| TransportError::InvalidEndpoint(endpoint.to_string()))?;
        if host.is_empty() {
            return Err(TransportError::InvalidEndpoint(endpoint.to_string()));
        }
        if port != 0 {
            return Ok(endpoint.to_string());
        }
        let endpoints = read(&self.endpoints);
        loop {
            let candidate = self.next_port.fetch_add(1, Ordering::SeqCst);
            let port = u16::try_from(candidate)
                .map_err(|_| TransportError::InvalidEndpoint(endpoint.to_string()))?;
            let resolved = format!("{}:{}", host, port);
            if !endpoints.contains_key(&resolved) {
                return Ok(resolved);
            }
        }
    }
}

impl Transport for InMemoryNetwork {
    fn connect(&self, endpoint: &str) -> Result<Box<dyn Publication + Send>, TransportError> {
        let endpoints = read(&self.endpoints);
        let slot = endpoints
            .get(endpoint)
            .ok_or_else(|| TransportError::UnknownEndpoint(endpoint.to_string()))?;
        if !slot.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed {
                endpoint: endpoint.to_string(),
            });
        }
        let publication = ChannelPublication {
            tx: slot.tx.clone(),
            open: slot.open.clone(),
            connected: self.connection_flag(endpoint),
        };
        Ok(Box::new(publication))
    }

    fn bind(&self, endpoint: &str, capacity: usize) -> Result<Box<dyn Subscription + Send>, TransportError> {
        let endpoint = self.resolve(endpoint)?;
        let mut endpoints = write(&self.endpoints);
        if let Some(existing) = endpoints.get(&endpoint) {
            if existing.open.load(Ordering::SeqCst) {
                return Err(TransportError::EndpointInUse(endpoint));
            }
        }

        let (tx, rx) = bounded(capacity.max(1));
        let open = Arc::new(AtomicBool::new(true));
        endpoints.insert(endpoint.clone(), EndpointSlot { tx, open: open.clone() });
        Ok(Box::new(ChannelSubscription { endpoint, rx, open }))
    }
}

/// Publication onto a bound channel.
pub struct ChannelPublication {
    tx: Sender<Vec<u8>>,
    open: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
}

impl Publication for ChannelPublication {
    fn offer(&mut self, buffer: &[u8]) -> OfferOutcome {
        if !self.open.load(Ordering::SeqCst) {
            return OfferOutcome::Closed;
        }
        if !self.connected.load(Ordering::SeqCst) {
            return OfferOutcome::NotConnected;
        }
        match self.tx.try_send(buffer.to_vec()) {
            Ok(()) => OfferOutcome::Accepted,
            Err(TrySendError::Full(_)) => OfferOutcome::BackPressured,
            Err(TrySendError::Disconnected(_)) => OfferOutcome::Closed,
        }
    }
}

/// Subscription draining a bound channel. Dropping it closes the endpoint.
pub struct ChannelSubscription {
    endpoint: String,
    rx: Receiver<Vec<u8>>,
    open: Arc<AtomicBool>,
}

impl Subscription for ChannelSubscription {
    fn poll(&mut self, handler: &mut dyn FnMut(&[u8]), limit: usize) -> usize {
        let mut delivered = 0;
        while delivered < limit {
            match self.rx.try_recv() {
                Ok(buffer) => {
                    handler(&buffer);
                    delivered += 1;
                }
                Err(_) => break,
            }
        }
        delivered
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Drop for ChannelSubscription {
    fn drop(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
