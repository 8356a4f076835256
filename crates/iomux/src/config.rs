use serde::{Deserialize, Serialize};

/// Runtime tuning knobs. Every field has a workable default; construct with
/// `Config::default()` and override through the `with_*` builders.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Size of each pooled buffer.
    pub buffer_size: usize,
    /// Free buffers kept for reuse before excess buffers are dropped.
    pub pool_hiwater: usize,
    /// Max scatter/gather descriptors per read/write syscall.
    pub max_num_iovec: usize,
    /// Listen backlog, applied per runtime.
    pub max_pending: usize,
    /// Initial capacity of each bind's send/recv bvec ring.
    pub ring_size: usize,
    /// Capacity of the kernel poll event batch.
    pub poll_events: usize,
    /// Busy-poll the readiness sources with a zero timeout instead of
    /// blocking in the kernel.
    pub busy_poll: bool,
    /// SO_SNDBUF for created sockets, when set.
    pub socket_sndbuf: Option<usize>,
    /// SO_RCVBUF for created sockets, when set.
    pub socket_rcvbuf: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_size: 1 << 20,
            pool_hiwater: 16,
            max_num_iovec: 64,
            max_pending: 128,
            ring_size: 64,
            poll_events: 256,
            busy_poll: false,
            socket_sndbuf: None,
            socket_rcvbuf: None,
        }
    }
}

impl Config {
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_pool_hiwater(mut self, hiwater: usize) -> Self {
        self.pool_hiwater = hiwater;
        self
    }

    pub fn with_max_num_iovec(mut self, max: usize) -> Self {
        self.max_num_iovec = max;
        self
    }

    pub fn with_max_pending(mut self, backlog: usize) -> Self {
        self.max_pending = backlog;
        self
    }

    pub fn with_ring_size(mut self, size: usize) -> Self {
        self.ring_size = size;
        self
    }

    pub fn with_busy_poll(mut self, busy: bool) -> Self {
        self.busy_poll = busy;
        self
    }

    /// Sets kernel SO_SNDBUF and SO_RCVBUF on all sockets the runtime
    /// creates.
    pub fn with_socket_buf_size(mut self, size: usize) -> Self {
        self.socket_sndbuf = Some(size);
        self.socket_rcvbuf = Some(size);
        self
    }
}
