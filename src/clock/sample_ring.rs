/// A fixed-capacity buffer retaining the `N` most recently added values.
pub struct SampleRing<T, const N: usize> {
    buf: BufferImpl<T, N>,
}
impl<T, const N: usize> SampleRing<T, N> {
    pub fn new() -> Self {
        assert!(N > 0);
        SampleRing {
            buf: BufferImpl::Growing(Vec::with_capacity(N)),
        }
    }

    /// adds a new value, returning the value that was evicted in its place (if any)
    pub fn add_value(&mut self, value: T) -> Option<T> {
        self.buf.add_value(value)
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// NB: iteration order is storage order, not insertion order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.as_slice().iter()
    }

    pub fn clear(&mut self) {
        self.buf = BufferImpl::Growing(Vec::with_capacity(N));
    }

    fn as_slice(&self) -> &[T] {
        match &self.buf {
            BufferImpl::Growing(buf) => buf,
            BufferImpl::Ring { buf, .. } => buf,
        }
    }
}

impl<T, const N: usize> Default for SampleRing<T, N> {
    fn default() -> Self {
        Self::new()
    }
}


enum BufferImpl<T, const N: usize> {
    Growing(Vec<T>),
    Ring {
        buf: Vec<T>,
        next: usize,
    },
}
impl <T, const N: usize> BufferImpl<T, N> {
    fn add_value(&mut self, value: T) -> Option<T> {
        match self {
            BufferImpl::Growing(buf) => {
                buf.push(value);
                if buf.len() == N {
                    let buf = std::mem::take(buf);
                    *self = BufferImpl::Ring { buf, next: 0 };
                }
                None
            }
            BufferImpl::Ring { buf, next } => {
                let evicted = std::mem::replace(&mut buf[*next], value);
                *next = (*next + 1) % N;
                Some(evicted)
            }
        }
    }
}
