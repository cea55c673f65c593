//! Receiver — one thread per incoming connection, deserializing subbands and
//! routing them to the collector that owns their file.
//!
//! A [`Receiver`] reads records until the peer closes the stream cleanly
//! (the orderly-shutdown sentinel) and routes each subband by file index
//! through a shared [`CollectorMap`]. The set of expected files is fixed up
//! front; a record for an unregistered file is a configuration mismatch and
//! aborts.
//!
//! [`MultiReceiver`] listens for senders and wraps every accepted connection
//! in a fresh `Receiver` sharing the same registry. Its accept loop polls
//! with a short timeout so shutdown never blocks on a silent network —
//! an accept timeout means "no more clients", not an error. `kill` either
//! waits for a minimum client count and drains everything gracefully, or
//! hard-kills by shutting the sockets down and abandoning in-flight work.

use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::collector::BlockCollector;
use crate::rt::{spawn_worker, WorkerConfig};
use crate::subband::Subband;
use crate::types::{Element, WireError};

/// How often the accept loop checks for shutdown while no client is calling.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Registry of collectors, keyed by file index. Shared read-only by every
/// receiver on the same listening endpoint.
pub struct CollectorMap<E: Element> {
    collectors: HashMap<u32, BlockCollector<E>>,
}

impl<E: Element> CollectorMap<E> {
    pub fn new(collectors: impl IntoIterator<Item = BlockCollector<E>>) -> Self {
        let collectors: HashMap<u32, BlockCollector<E>> = collectors
            .into_iter()
            .map(|c| (c.config().file, c))
            .collect();
        Self { collectors }
    }

    pub fn get(&self, file: u32) -> Option<&BlockCollector<E>> {
        self.collectors.get(&file)
    }

    pub fn files(&self) -> impl Iterator<Item = u32> + '_ {
        self.collectors.keys().copied()
    }

    /// Route a subband to its collector. An unregistered file index is fatal.
    pub fn route(&self, subband: Subband<E>) {
        let id = subband.id();
        match self.collectors.get(&id.file) {
            Some(collector) => collector.append(subband),
            None => panic!("no collector registered for subband {}", id),
        }
    }

    /// Finish every collector. Safe to call from more than one shutdown path;
    /// each collector's `finish` is idempotent.
    pub fn finish_all(&self) {
        for collector in self.collectors.values() {
            collector.finish();
        }
    }
}

/// Reads one stream of serialized subbands on a dedicated thread.
pub struct Receiver<E: Element> {
    thread: JoinHandle<Result<(), WireError>>,
    stream: TcpStream,
    killed: Arc<AtomicBool>,
    _marker: std::marker::PhantomData<E>,
}

impl<E: Element> Receiver<E> {
    /// Spawn a read loop over `stream`, routing through `collectors`.
    pub fn spawn(stream: TcpStream, collectors: Arc<CollectorMap<E>>) -> io::Result<Self> {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".into());
        let killed = Arc::new(AtomicBool::new(false));
        let thread = {
            let stream = stream.try_clone()?;
            let killed = Arc::clone(&killed);
            spawn_worker(WorkerConfig::new(format!("recv-{}", peer)), move || {
                read_loop(stream, &collectors, &killed)
            })?
        };
        Ok(Self {
            thread,
            stream,
            killed,
            _marker: std::marker::PhantomData,
        })
    }

    /// Abandon the stream: wake the read loop by shutting the socket down.
    fn shutdown(&self) {
        self.killed.store(true, Ordering::SeqCst);
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    /// Join the read loop, reporting whether it ended exceptionally.
    /// Contract-violation panics from the loop resurface here.
    pub fn finish(self) -> Result<(), WireError> {
        match self.thread.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

fn read_loop<E: Element>(
    stream: TcpStream,
    collectors: &CollectorMap<E>,
    killed: &AtomicBool,
) -> Result<(), WireError> {
    let mut reader = BufReader::new(stream);
    loop {
        match Subband::<E>::read_from(&mut reader) {
            Ok(subband) => collectors.route(subband),
            Err(WireError::EndOfStream) => return Ok(()),
            Err(e) if killed.load(Ordering::SeqCst) => {
                // Abandoned mid-record by a hard kill; not a protocol fault.
                tracing::debug!("receiver killed: {}", e);
                return Err(e);
            }
            Err(e @ WireError::Io(_)) => {
                tracing::warn!("receiver stream failed: {}", e);
                return Err(e);
            }
            Err(e) => panic!("corrupt subband stream: {}", e),
        }
    }
}

struct AcceptState<E: Element> {
    receivers: Mutex<Vec<Receiver<E>>>,
    connected: Condvar,
    stop: AtomicBool,
}

/// Accepts one connection per sender and runs a [`Receiver`] for each.
pub struct MultiReceiver<E: Element> {
    collectors: Arc<CollectorMap<E>>,
    state: Arc<AcceptState<E>>,
    local_addr: SocketAddr,
    accept_loop: Option<JoinHandle<()>>,
}

impl<E: Element> MultiReceiver<E> {
    /// Bind `addr` and start accepting senders.
    pub fn bind(addr: &str, collectors: Arc<CollectorMap<E>>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        tracing::info!("listening for subband streams on {}", local_addr);

        let state = Arc::new(AcceptState {
            receivers: Mutex::new(Vec::new()),
            connected: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        let accept_loop = {
            let state = Arc::clone(&state);
            let collectors = Arc::clone(&collectors);
            spawn_worker(WorkerConfig::new(format!("accept-{}", local_addr)), move || {
                accept_loop(listener, &state, &collectors)
            })?
        };

        Ok(Self {
            collectors,
            state,
            local_addr,
            accept_loop: Some(accept_loop),
        })
    }

    /// The bound address (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of senders accepted so far.
    pub fn nr_clients(&self) -> usize {
        self.state.receivers.lock().unwrap().len()
    }

    /// Stop the listener and the receivers.
    ///
    /// With `min_clients = Some(n)`, first waits until at least `n` senders
    /// have connected, then drains every receiver and finishes the
    /// collectors (coordinated, graceful shutdown). With `None`, stops
    /// immediately and hard-kills the receivers, abandoning whatever was in
    /// flight.
    pub fn kill(mut self, min_clients: Option<usize>) {
        if let Some(min) = min_clients {
            let guard = self.state.receivers.lock().unwrap();
            let _guard = self
                .state
                .connected
                .wait_while(guard, |r| r.len() < min)
                .unwrap();
        }

        self.state.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_loop.take() {
            let _ = handle.join();
        }

        let receivers: Vec<Receiver<E>> =
            std::mem::take(&mut *self.state.receivers.lock().unwrap());
        match min_clients {
            Some(_) => {
                for receiver in receivers {
                    if let Err(e) = receiver.finish() {
                        tracing::warn!("receiver ended with error during drain: {}", e);
                    }
                }
                self.collectors.finish_all();
            }
            None => {
                for receiver in &receivers {
                    receiver.shutdown();
                }
                for receiver in receivers {
                    let _ = receiver.finish();
                }
            }
        }
    }
}

impl<E: Element> Drop for MultiReceiver<E> {
    fn drop(&mut self) {
        self.state.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_loop.take() {
            let _ = handle.join();
        }
    }
}

fn accept_loop<E: Element>(
    listener: TcpListener,
    state: &AcceptState<E>,
    collectors: &Arc<CollectorMap<E>>,
) {
    while !state.stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::info!("accepted subband stream from {}", peer);
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                match Receiver::spawn(stream, Arc::clone(collectors)) {
                    Ok(receiver) => {
                        let mut receivers = state.receivers.lock().unwrap();
                        receivers.push(receiver);
                        state.connected.notify_all();
                    }
                    Err(e) => tracing::warn!("could not start receiver for {}: {}", peer, e),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // No caller right now; check for shutdown and keep listening.
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                tracing::warn!("accept failed: {}", e);
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}

/// Serialize subbands to a plain TCP stream. Test-side counterpart of the
/// receive path; production senders use [`crate::sender::MultiSender`].
pub fn write_stream<E: Element>(
    stream: TcpStream,
    subbands: impl IntoIterator<Item = Subband<E>>,
) -> io::Result<()> {
    let mut writer = BufWriter::new(stream);
    for subband in subbands {
        subband.write_to(&mut writer)?;
    }
    writer.flush()
}
