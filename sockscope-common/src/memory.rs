/// A read from foreign memory faulted (unmapped page, bad pointer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadError;

/// Copies bytes out of memory this code does not own: user memory of the
/// traced process or opaque kernel objects.
///
/// Implementations must either fill all of `dst` or fail.
pub trait MemoryReader {
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<(), ReadError>;

    fn read_u16(&self, addr: u64) -> Result<u16, ReadError> {
        let mut raw = [0u8; 2];
        self.read(addr, &mut raw)?;
        Ok(u16::from_ne_bytes(raw))
    }

    fn read_u32(&self, addr: u64) -> Result<u32, ReadError> {
        let mut raw = [0u8; 4];
        self.read(addr, &mut raw)?;
        Ok(u32::from_ne_bytes(raw))
    }

    fn read_u64(&self, addr: u64) -> Result<u64, ReadError> {
        let mut raw = [0u8; 8];
        self.read(addr, &mut raw)?;
        Ok(u64::from_ne_bytes(raw))
    }
}

impl<M: MemoryReader + ?Sized> MemoryReader for &M {
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<(), ReadError> {
        (**self).read(addr, dst)
    }
}
