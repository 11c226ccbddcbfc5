//! Session-level metrics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "sessions_created",
    description = "Total number of sessions created"
)]
pub static SESSIONS_CREATED: Counter = Counter::new();

#[metric(
    name = "sessions_destroyed",
    description = "Total number of sessions destroyed"
)]
pub static SESSIONS_DESTROYED: Counter = Counter::new();

#[metric(name = "sessions_active", description = "Number of live sessions")]
pub static SESSIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "session_bytes_read",
    description = "Total bytes read from transports"
)]
pub static BYTES_READ: Counter = Counter::new();

#[metric(
    name = "session_bytes_written",
    description = "Total bytes written to transports"
)]
pub static BYTES_WRITTEN: Counter = Counter::new();

#[metric(
    name = "transactions_opened",
    description = "Total transactions admitted or initiated"
)]
pub static TRANSACTIONS_OPENED: Counter = Counter::new();

#[metric(
    name = "transactions_aborted",
    description = "Total transactions terminated by abort"
)]
pub static TRANSACTIONS_ABORTED: Counter = Counter::new();

#[metric(
    name = "transactions_refused",
    description = "Streams refused at admission for exceeding a concurrency cap"
)]
pub static TRANSACTIONS_REFUSED: Counter = Counter::new();

#[metric(
    name = "ingress_limit_exceeded",
    description = "Times aggregate buffered ingress crossed the read buffer limit"
)]
pub static INGRESS_LIMIT_EXCEEDED: Counter = Counter::new();

#[metric(
    name = "egress_paused",
    description = "Times session egress was paused for exceeding the pending write cap"
)]
pub static EGRESS_PAUSED: Counter = Counter::new();

#[metric(name = "pings_sent", description = "Ping requests sent")]
pub static PINGS_SENT: Counter = Counter::new();
