use std::any::Any;
use std::fmt;

use slab::Slab;

use crate::framework::MAX_FRAMEWORKS;

/// Key of a pooled buffer inside its owning [`BufferPool`].
///
/// Stable for the lifetime of the buffer; keys are recycled after the
/// buffer is dropped, so stale ids must not be retained.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(usize);

impl BufferId {
    const NULL: Self = Self(usize::MAX);
}

impl fmt::Debug for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// A byte vector: a refcounted slice of a pooled buffer plus an
/// end-of-message marker.
///
/// Holding a `Bvec` implies one refcount unit on the underlying buffer.
/// `Bvec` is `Copy` and refcounts are explicit: copies that outlive the
/// original must be paired with [`BufferPool::incref`], and every owned
/// bvec must eventually go through [`BufferPool::release`]. Rings and the
/// runtime manage this internally; application code only balances the
/// bvecs it allocates or receives from `recv`.
#[derive(Clone, Copy, Debug)]
pub struct Bvec {
    buffer: BufferId,
    offset: u32,
    len: u32,
    eom: bool,
}

impl Bvec {
    pub(crate) const fn null() -> Self {
        Self { buffer: BufferId::NULL, offset: 0, len: 0, eom: false }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// End-of-message marker; set on the final bvec of each datagram or
    /// message-mode send.
    #[inline]
    pub fn eom(&self) -> bool {
        self.eom
    }

    #[inline]
    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    #[inline]
    pub(crate) fn set_eom(&mut self, eom: bool) {
        self.eom = eom;
    }

    #[inline]
    pub(crate) fn offset(&self) -> usize {
        self.offset as usize
    }

    #[inline]
    pub(crate) fn end(&self) -> usize {
        (self.offset + self.len) as usize
    }

    /// Drops `n` bytes from the front. The refcount is untouched.
    #[inline]
    pub(crate) fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.offset += n as u32;
        self.len -= n as u32;
    }

    /// Descriptor for the first `n` bytes. Does not touch refcounts.
    #[inline]
    pub(crate) fn front(&self, n: usize, eom: bool) -> Self {
        debug_assert!(n <= self.len());
        Self { buffer: self.buffer, offset: self.offset, len: n as u32, eom }
    }

    /// Extends the descriptor by `n` bytes; only valid for the coalescing
    /// append, where the extension is known to be inside the buffer.
    #[inline]
    pub(crate) fn extend(&mut self, n: usize) {
        self.len += n as u32;
    }

    /// True when `other` starts exactly where `self` ends, in the same
    /// buffer. Used by the ring's coalescing append.
    #[inline]
    pub(crate) fn is_contiguous_with(&self, other: &Self) -> bool {
        self.buffer == other.buffer && self.end() == other.offset()
    }
}

struct Buffer {
    data: Box<[u8]>,
    used: usize,
    refcnt: usize,
    framework_private: [Option<Box<dyn Any>>; MAX_FRAMEWORKS],
}

impl Buffer {
    fn new(size: usize) -> Self {
        Self {
            data: vec![0_u8; size].into_boxed_slice(),
            used: 0,
            refcnt: 0,
            framework_private: Default::default(),
        }
    }

    #[inline]
    fn left(&self) -> usize {
        self.data.len() - self.used
    }
}

/// Bytes needed to advance `used` to the next multiple of `alignment`
/// (a power of two; zero or one means no padding).
#[inline]
pub fn pad(used: usize, alignment: usize) -> usize {
    if alignment < 2 {
        return 0;
    }
    debug_assert!(alignment.is_power_of_two());
    (alignment - (used & (alignment - 1))) & (alignment - 1)
}

/// Per-runtime buffer pool.
///
/// Buffers are fixed-size regions bump-allocated into bvec slices and
/// recycled through a free list once their refcount drops to zero. All
/// refcount mutation happens on the runtime's thread.
pub struct BufferPool {
    buffer_size: usize,
    hiwater: usize,
    buffers: Slab<Buffer>,
    free: Vec<BufferId>,
    /// Bump-allocation source for [`alloc`](Self::alloc); the pool holds
    /// one owning ref on it while installed.
    current: Option<BufferId>,
}

impl BufferPool {
    pub(crate) fn new(buffer_size: usize, hiwater: usize) -> Self {
        assert!(buffer_size > 0, "buffer size must be non-zero");
        Self {
            buffer_size,
            hiwater,
            buffers: Slab::new(),
            free: Vec::new(),
            current: None,
        }
    }

    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// A bvec covering one fresh (or recycled) whole buffer. The returned
    /// bvec owns the buffer's only refcount unit.
    pub fn alloc_whole(&mut self) -> Bvec {
        let id = self.take_buffer();
        let buf = &mut self.buffers[id.0];
        buf.used = buf.data.len();
        buf.refcnt = 1;
        Bvec { buffer: id, offset: 0, len: buf.data.len() as u32, eom: false }
    }

    /// Bump-allocates `length` bytes as 1..=`max_bvecs` contiguous segments,
    /// each aligned to `alignment`, pushed onto `out`. Returns the number of
    /// segments.
    ///
    /// Fatal if `length` cannot fit in `max_bvecs` whole buffers; resource
    /// exhaustion here is a programming error at a higher layer, not a
    /// recoverable condition.
    pub fn alloc(
        &mut self,
        length: usize,
        alignment: usize,
        max_bvecs: usize,
        out: &mut Vec<Bvec>,
    ) -> usize {
        assert!(length > 0 && max_bvecs > 0, "zero-sized allocation");
        assert!(
            length <= max_bvecs * self.buffer_size,
            "allocation of {length} bytes cannot fit {max_bvecs} bvecs of {} byte buffers",
            self.buffer_size
        );

        // Retire a partially-used current buffer when its remainder would
        // blow the segment budget.
        let cur_left = self.current.map_or(0, |id| {
            let buf = &self.buffers[id.0];
            buf.left().saturating_sub(pad(buf.used, alignment))
        });
        if length > cur_left + (max_bvecs - 1) * self.buffer_size {
            self.retire_current();
        }

        let mut remain = length;
        let mut niov = 0;
        while remain > 0 {
            let id = match self.current {
                Some(id) => id,
                None => self.install_current(),
            };
            let buf = &mut self.buffers[id.0];
            let skip = pad(buf.used, alignment);
            let left = buf.left().saturating_sub(skip);
            if left == 0 {
                self.retire_current();
                continue;
            }
            let chunk = left.min(remain);
            buf.used += skip;
            let bvec = Bvec {
                buffer: id,
                offset: buf.used as u32,
                len: chunk as u32,
                eom: false,
            };
            buf.used += chunk;
            buf.refcnt += 1;
            let exhausted = buf.left() == 0;
            out.push(bvec);
            niov += 1;
            remain -= chunk;
            if exhausted {
                self.retire_current();
            }
        }
        niov
    }

    /// Adds one refcount unit for an additional live copy of `bvec`.
    #[inline]
    pub fn incref(&mut self, bvec: &Bvec) {
        self.buffers[bvec.buffer.0].refcnt += 1;
    }

    /// Releases one refcount unit; the buffer returns to the pool on the
    /// last release. Releasing past zero is a double free and fatal.
    pub fn release(&mut self, bvec: Bvec) {
        self.release_buffer(bvec.buffer);
    }

    pub(crate) fn release_buffer(&mut self, id: BufferId) {
        let buf = &mut self.buffers[id.0];
        assert!(buf.refcnt > 0, "double release of {id:?}");
        buf.refcnt -= 1;
        if buf.refcnt == 0 {
            self.recycle(id);
        }
    }

    #[inline]
    pub fn refcnt(&self, id: BufferId) -> usize {
        self.buffers[id.0].refcnt
    }

    /// The bytes a bvec describes.
    #[inline]
    pub fn slice(&self, bvec: &Bvec) -> &[u8] {
        &self.buffers[bvec.buffer.0].data[bvec.offset()..bvec.end()]
    }

    #[inline]
    pub fn slice_mut(&mut self, bvec: &Bvec) -> &mut [u8] {
        &mut self.buffers[bvec.buffer.0].data[bvec.offset()..bvec.end()]
    }

    /// Mutable views of two bvecs backed by distinct buffers, for
    /// scatter reads across a staging boundary.
    pub(crate) fn slice_pair_mut(&mut self, a: &Bvec, b: &Bvec) -> (&mut [u8], &mut [u8]) {
        let (ba, bb) = self
            .buffers
            .get2_mut(a.buffer.0, b.buffer.0)
            .expect("slice_pair_mut on missing buffers");
        (
            &mut ba.data[a.offset()..a.end()],
            &mut bb.data[b.offset()..b.end()],
        )
    }

    /// Opaque per-framework storage on the underlying buffer; survives
    /// recycling so drivers can cache registrations.
    pub fn framework_private(&self, id: BufferId, framework: usize) -> Option<&(dyn Any)> {
        self.buffers[id.0].framework_private[framework].as_deref()
    }

    pub fn set_framework_private(
        &mut self,
        id: BufferId,
        framework: usize,
        private: Box<dyn Any>,
    ) {
        self.buffers[id.0].framework_private[framework] = Some(private);
    }

    fn take_buffer(&mut self) -> BufferId {
        if let Some(id) = self.free.pop() {
            return id;
        }
        BufferId(self.buffers.insert(Buffer::new(self.buffer_size)))
    }

    fn install_current(&mut self) -> BufferId {
        let id = self.take_buffer();
        self.buffers[id.0].refcnt = 1;
        self.current = Some(id);
        id
    }

    fn retire_current(&mut self) {
        if let Some(id) = self.current.take() {
            self.release_buffer(id);
        }
    }

    fn recycle(&mut self, id: BufferId) {
        let buf = &mut self.buffers[id.0];
        buf.used = 0;
        if self.free.len() >= self.hiwater {
            self.buffers.remove(id.0);
        } else {
            self.free.push(id);
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.retire_current();
        if !std::thread::panicking() {
            let live = self.buffers.iter().filter(|(_, b)| b.refcnt > 0).count();
            iomux_utils::invariant!(live == 0, "buffer pool dropped with {live} live buffers");
        }
    }
}
