//! MultiSender — routes outgoing subbands to per-destination queues and
//! drains each queue over its own TCP connection.
//!
//! The sending side of the transpose: a local producer appends subbands,
//! each is routed by file index to the queue of its destination host, and
//! one worker per distinct host drains that queue onto the wire. Destinations
//! fail independently: a host that refuses connections or drops mid-stream is
//! logged and abandoned, its queued data discarded, while every other worker
//! keeps sending. Connections open lazily, on the first subband a host
//! actually receives.
//!
//! Queues are bounded; whether a full queue parks the producer or sheds the
//! oldest subband is deployment policy ([`OverflowPolicy`]), chosen by
//! whether completeness or freshness matters more at that site.

use std::collections::HashMap;
use std::io::{self, BufWriter, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use crate::queue::{BoundedQueue, OverflowPolicy};
use crate::subband::Subband;
use crate::types::Element;

/// Routing and queue policy for one sender.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// File index → destination `host:port`. Files may share a destination;
    /// each distinct destination gets one queue and one worker.
    pub routes: HashMap<u32, String>,
    /// Capacity of each per-destination queue, in subbands.
    pub queue_capacity: usize,
    /// What a full queue does: park the producer, or shed the oldest.
    pub overflow_policy: OverflowPolicy,
    /// Per-attempt connection timeout.
    pub connect_timeout: Duration,
    /// Connection attempts before a destination is declared dead.
    pub connect_attempts: u32,
    /// Pause between connection attempts.
    pub retry_interval: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
            queue_capacity: 256,
            overflow_policy: OverflowPolicy::Block,
            connect_timeout: Duration::from_secs(5),
            connect_attempts: 3,
            retry_interval: Duration::from_millis(500),
        }
    }
}

/// Fans subbands out to their destination hosts.
pub struct MultiSender<E: Element> {
    cfg: SenderConfig,
    /// file index → queue of its destination.
    by_file: HashMap<u32, Arc<BoundedQueue<Subband<E>>>>,
    /// One entry per distinct destination.
    hosts: Vec<(String, Arc<BoundedQueue<Subband<E>>>)>,
}

impl<E: Element> MultiSender<E> {
    pub fn new(cfg: SenderConfig) -> Self {
        let mut queues: HashMap<String, Arc<BoundedQueue<Subband<E>>>> = HashMap::new();
        let mut by_file = HashMap::new();
        for (&file, host) in &cfg.routes {
            let queue = queues
                .entry(host.clone())
                .or_insert_with(|| {
                    Arc::new(BoundedQueue::new(cfg.queue_capacity, cfg.overflow_policy))
                })
                .clone();
            by_file.insert(file, queue);
        }
        let mut hosts: Vec<_> = queues.into_iter().collect();
        hosts.sort_by(|a, b| a.0.cmp(&b.0));
        Self { cfg, by_file, hosts }
    }

    /// Number of distinct destinations.
    pub fn nr_destinations(&self) -> usize {
        self.hosts.len()
    }

    /// Total subbands shed by full queues so far.
    pub fn nr_shed(&self) -> u64 {
        self.hosts.iter().map(|(_, q)| q.evicted()).sum()
    }

    /// Queue a subband for its destination. Routing an unknown file index is
    /// a configuration mismatch and fatal, as is appending after `finish`.
    pub fn append(&self, subband: Subband<E>) {
        let id = subband.id();
        let queue = self
            .by_file
            .get(&id.file)
            .unwrap_or_else(|| panic!("no destination routed for subband {}", id));
        match queue.push(subband) {
            Ok(None) => {}
            Ok(Some(shed)) => {
                tracing::trace!("queue full, shed subband {}", shed.id());
            }
            Err(refused) => panic!("subband {} appended after finish", refused.0.id()),
        }
    }

    /// Drain every destination queue concurrently, one worker per host.
    ///
    /// Returns once every worker has exited, which happens after `finish`
    /// closes the queues (or earlier for destinations that failed). Run this
    /// on its own thread when the producer lives on the calling thread.
    pub fn process(&self) {
        rayon::scope(|s| {
            for (host, queue) in &self.hosts {
                let cfg = &self.cfg;
                s.spawn(move |_| drain_destination(host, queue, cfg));
            }
        });
    }

    /// Declare the stream over: close every queue so workers drain and exit.
    pub fn finish(&self) {
        for (_, queue) in &self.hosts {
            queue.close();
        }
    }
}

/// Worker body for one destination: lazy connect, then serialize until the
/// queue closes and drains. Any failure abandons only this destination.
fn drain_destination<E: Element>(
    host: &str,
    queue: &BoundedQueue<Subband<E>>,
    cfg: &SenderConfig,
) {
    // Connect lazily: a destination that never gets data never connects.
    let Some(first) = queue.pop() else {
        tracing::debug!("no subbands for {}", host);
        return;
    };

    let stream = match connect(host, cfg) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!("cannot reach {}: {}", host, e);
            discard_remaining(host, queue, 1);
            return;
        }
    };
    let mut writer = BufWriter::new(stream);

    let mut sent = 0u64;
    let mut next = Some(first);
    while let Some(subband) = next.take().or_else(|| queue.pop()) {
        if let Err(e) = subband.write_to(&mut writer) {
            tracing::error!("send to {} failed after {} subbands: {}", host, sent, e);
            discard_remaining(host, queue, 1);
            return;
        }
        sent += 1;
    }

    if let Err(e) = writer.flush() {
        tracing::error!("flush to {} failed: {}", host, e);
        return;
    }
    tracing::info!("sent {} subbands to {}", sent, host);
}

fn connect(host: &str, cfg: &SenderConfig) -> io::Result<TcpStream> {
    let addr = host
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unresolvable destination"))?;

    let mut last_err = None;
    for attempt in 1..=cfg.connect_attempts.max(1) {
        match TcpStream::connect_timeout(&addr, cfg.connect_timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!("connect attempt {} to {} failed: {}", attempt, host, e);
                last_err = Some(e);
                std::thread::sleep(cfg.retry_interval);
            }
        }
    }
    Err(last_err.unwrap())
}

/// Keep the dead destination's queue from wedging producers: swallow and
/// count everything still queued until `finish` closes it.
fn discard_remaining<E: Element>(host: &str, queue: &BoundedQueue<Subband<E>>, already: u64) {
    let mut discarded = already;
    while queue.pop().is_some() {
        discarded += 1;
    }
    tracing::warn!(
        "discarded {} subbands bound for unreachable {}",
        discarded,
        host
    );
}
