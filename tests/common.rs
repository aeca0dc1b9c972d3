//! Test utilities & fixtures.
//! A scripted serial backend that records every open and enumeration so tests
//! can assert exactly how much I/O a connect cycle performed.

#![allow(dead_code)] // Each test binary uses a different subset.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use scalebridge::scale::ReconnectPolicy;
use scalebridge::serial::{
    DeviceIdentity, OpenError, OpenParams, PortCandidate, ScaleHandle, SerialBackend,
};

pub const STM32_VCP: DeviceIdentity = DeviceIdentity::new(0x0483, 0x5740);

type OpenRule = Box<dyn Fn(&OpenParams) -> Result<(), OpenError> + Send + Sync>;
type Inbox = Arc<Mutex<VecDeque<io::Result<Vec<u8>>>>>;

pub struct MockBackend {
    rule: OpenRule,
    scripted_ports: Mutex<VecDeque<Vec<PortCandidate>>>,
    last_ports: Mutex<Vec<PortCandidate>>,
    opens: Mutex<Vec<OpenParams>>,
    enumerations: AtomicUsize,
    inbox: Inbox,
}

impl MockBackend {
    /// Backend whose opens succeed or fail according to `rule`.
    pub fn new<F>(rule: F) -> Self
    where
        F: Fn(&OpenParams) -> Result<(), OpenError> + Send + Sync + 'static,
    {
        Self {
            rule: Box::new(rule),
            scripted_ports: Mutex::new(VecDeque::new()),
            last_ports: Mutex::new(Vec::new()),
            opens: Mutex::new(Vec::new()),
            enumerations: AtomicUsize::new(0),
            inbox: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn accepting_all() -> Self {
        Self::new(|_| Ok(()))
    }

    pub fn refusing_all() -> Self {
        Self::new(|p| Err(not_found(&p.path)))
    }

    /// Enumeration results, one list per call; the last list repeats once the
    /// script runs out.
    pub fn with_ports(self, rounds: Vec<Vec<PortCandidate>>) -> Self {
        *self.scripted_ports.lock().unwrap() = rounds.into();
        self
    }

    pub fn opens(&self) -> Vec<OpenParams> {
        self.opens.lock().unwrap().clone()
    }

    pub fn open_count(&self) -> usize {
        self.opens.lock().unwrap().len()
    }

    pub fn enumerate_count(&self) -> usize {
        self.enumerations.load(Ordering::SeqCst)
    }

    /// Queue bytes for the next read on any handle this backend opened.
    pub fn feed(&self, bytes: &[u8]) {
        self.inbox.lock().unwrap().push_back(Ok(bytes.to_vec()));
    }

    /// Make the next read fail as if the device was unplugged.
    pub fn fail_next_read(&self) {
        self.inbox.lock().unwrap().push_back(Err(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "device disconnected",
        )));
    }
}

impl SerialBackend for MockBackend {
    fn enumerate(&self) -> io::Result<Vec<PortCandidate>> {
        self.enumerations.fetch_add(1, Ordering::SeqCst);
        let mut last = self.last_ports.lock().unwrap();
        if let Some(next) = self.scripted_ports.lock().unwrap().pop_front() {
            *last = next;
        }
        Ok(last.clone())
    }

    fn open(&self, params: &OpenParams) -> Result<Box<dyn ScaleHandle>, OpenError> {
        self.opens.lock().unwrap().push(params.clone());
        (self.rule)(params)?;
        Ok(Box::new(MockHandle {
            inbox: self.inbox.clone(),
        }))
    }
}

struct MockHandle {
    inbox: Inbox,
}

impl ScaleHandle for MockHandle {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inbox = self.inbox.lock().unwrap();
        match inbox.pop_front() {
            None => Ok(0),
            Some(Err(e)) => Err(e),
            Some(Ok(mut bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    inbox.push_front(Ok(bytes.split_off(n)));
                }
                Ok(n)
            }
        }
    }
}

pub fn not_found(path: &str) -> OpenError {
    OpenError::NotFound {
        path: path.to_string(),
        message: "The system cannot find the file specified.".to_string(),
    }
}

pub fn denied(path: &str) -> OpenError {
    OpenError::BusyOrDenied {
        path: path.to_string(),
        message: "Access is denied.".to_string(),
    }
}

pub fn wedged(path: &str) -> OpenError {
    OpenError::Transient {
        path: path.to_string(),
        message: "A device attached to the system is not functioning.".to_string(),
    }
}

/// Default policy with every pause removed so cycles run instantly.
/// The throttle window is kept at its default.
pub fn fast_policy(identity: Option<DeviceIdentity>) -> ReconnectPolicy {
    ReconnectPolicy {
        identity,
        rescan_backoff: Duration::ZERO,
        teardown_pause: Duration::ZERO,
        read_timeout: Duration::from_millis(10),
        ..ReconnectPolicy::default()
    }
}
