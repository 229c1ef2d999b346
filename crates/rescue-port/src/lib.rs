#![cfg_attr(not(feature = "std"), no_std)]

//! Byte-oriented transport traits shared by the rescue device and the host tool.
//!
//! The link has no framing and no error correction: a reader asks for exactly
//! `buf.len()` bytes and blocks until they arrive.

#[cfg(feature = "serialport")]
use serialport::SerialPort;

use crate::err::Error;

pub mod err;
#[cfg(feature = "std")]
pub mod loopback;

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(feature = "serialport")]
pub type Port = Box<dyn SerialPort>;

pub trait FromBytes<const N: usize> {
    fn from_be(bytes: [u8; N]) -> Self;
    fn from_le(bytes: [u8; N]) -> Self;
}

pub trait ToBytes<const N: usize> {
    fn to_be(&self) -> [u8; N];
    fn to_le(&self) -> [u8; N];
}

pub trait SimpleRead {
    /// Fill `buf` completely, blocking until enough data arrived.
    fn read(&mut self, buf: &mut [u8]) -> Result<()>;

    fn simple_read_be<T: FromBytes<N>, const N: usize>(&mut self) -> Result<T> {
        let mut bytes = [0; N];
        Self::read(self, &mut bytes)?;
        Ok(T::from_be(bytes))
    }

    fn simple_read_le<T: FromBytes<N>, const N: usize>(&mut self) -> Result<T> {
        let mut bytes = [0; N];
        Self::read(self, &mut bytes)?;
        Ok(T::from_le(bytes))
    }

    fn read_u8(&mut self) -> Result<u8> {
        self.simple_read_be()
    }

    fn read_u16_le(&mut self) -> Result<u16> {
        self.simple_read_le()
    }

    fn read_u32_le(&mut self) -> Result<u32> {
        self.simple_read_le()
    }
}

pub trait SimpleWrite {
    fn write(&mut self, buf: &[u8]) -> Result<()>;

    fn simple_write_be<T: ToBytes<N>, const N: usize>(&mut self, value: T) -> Result<()> {
        Self::write(self, &value.to_be())
    }

    fn simple_write_le<T: ToBytes<N>, const N: usize>(&mut self, value: T) -> Result<()> {
        Self::write(self, &value.to_le())
    }

    fn write_u8(&mut self, value: u8) -> Result<()> {
        self.simple_write_be(value)
    }

    fn write_u16_le(&mut self, value: u16) -> Result<()> {
        self.simple_write_le(value)
    }

    fn write_u32_le(&mut self, value: u32) -> Result<()> {
        self.simple_write_le(value)
    }
}

/// Non-blocking check for received data.
pub trait SimplePoll {
    /// `true` if at least one byte can be read without blocking.
    fn poll(&mut self) -> bool;
}

macro_rules! impl_bytes {
    ($($ty:ty => $n:literal),+ $(,)?) => {
        $(
            impl FromBytes<$n> for $ty {
                fn from_be(bytes: [u8; $n]) -> Self {
                    Self::from_be_bytes(bytes)
                }

                fn from_le(bytes: [u8; $n]) -> Self {
                    Self::from_le_bytes(bytes)
                }
            }

            impl ToBytes<$n> for $ty {
                fn to_be(&self) -> [u8; $n] {
                    self.to_be_bytes()
                }

                fn to_le(&self) -> [u8; $n] {
                    self.to_le_bytes()
                }
            }
        )+
    };
}

impl_bytes!(u8 => 1, u16 => 2, u32 => 4);

impl<T: SimpleRead + ?Sized> SimpleRead for &mut T {
    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        (**self).read(buf)
    }
}

impl<T: SimpleWrite + ?Sized> SimpleWrite for &mut T {
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        (**self).write(buf)
    }
}

impl<T: SimplePoll + ?Sized> SimplePoll for &mut T {
    fn poll(&mut self) -> bool {
        (**self).poll()
    }
}

#[cfg(feature = "serialport")]
impl SimpleRead for Port {
    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.read_exact(buf).map_err(|e| e.into())
    }
}

#[cfg(feature = "serialport")]
impl SimpleWrite for Port {
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.write_all(buf)?;
        self.flush().map_err(|e| e.into())
    }
}

#[cfg(feature = "serialport")]
impl SimplePoll for Port {
    fn poll(&mut self) -> bool {
        self.bytes_to_read().is_ok_and(|n| n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Cursor<'a> {
        data: &'a [u8],
        out: [u8; 8],
        written: usize,
    }

    impl SimpleRead for Cursor<'_> {
        fn read(&mut self, buf: &mut [u8]) -> Result<()> {
            if self.data.len() < buf.len() {
                return Err(Error::Closed);
            }
            let (head, tail) = self.data.split_at(buf.len());
            buf.copy_from_slice(head);
            self.data = tail;
            Ok(())
        }
    }

    impl SimpleWrite for Cursor<'_> {
        fn write(&mut self, buf: &[u8]) -> Result<()> {
            self.out[self.written..self.written + buf.len()].copy_from_slice(buf);
            self.written += buf.len();
            Ok(())
        }
    }

    #[test]
    fn reads_little_endian_words() {
        let mut cursor = Cursor { data: &[0x11, 0x05, 0x00, 0x78, 0x56, 0x34, 0x12], out: [0; 8], written: 0 };
        assert_eq!(cursor.read_u8().unwrap(), 0x11);
        assert_eq!(cursor.read_u16_le().unwrap(), 5);
        assert_eq!(cursor.read_u32_le().unwrap(), 0x1234_5678);
        assert!(matches!(cursor.read_u8(), Err(Error::Closed)));
    }

    #[test]
    fn writes_little_endian_words() {
        let mut cursor = Cursor { data: &[], out: [0; 8], written: 0 };
        cursor.write_u8(0x01).unwrap();
        cursor.write_u16_le(0x0203).unwrap();
        cursor.write_u32_le(0xcbf4_3926).unwrap();
        assert_eq!(cursor.out[..7], [0x01, 0x03, 0x02, 0x26, 0x39, 0xf4, 0xcb]);
    }
}
