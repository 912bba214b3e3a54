//! Serial (Modbus-RTU) transport (spec.md §4.1).

#[cfg(feature = "serial")]
mod imp {
    use crate::error::TransportError;
    use crate::transport::{SerialParity, Transport};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};

    pub struct SerialTransport {
        port: String,
        baud: u32,
        data_bits: u8,
        parity: SerialParity,
        stop_bits: u8,
        stream: Option<SerialStream>,
    }

    impl SerialTransport {
        pub fn new(port: String, baud: u32, data_bits: u8, parity: SerialParity, stop_bits: u8) -> Self {
            Self {
                port,
                baud,
                data_bits,
                parity,
                stop_bits,
                stream: None,
            }
        }

        fn data_bits(&self) -> DataBits {
            match self.data_bits {
                5 => DataBits::Five,
                6 => DataBits::Six,
                7 => DataBits::Seven,
                _ => DataBits::Eight,
            }
        }

        fn parity(&self) -> Parity {
            match self.parity {
                SerialParity::None => Parity::None,
                SerialParity::Even => Parity::Even,
                SerialParity::Odd => Parity::Odd,
            }
        }

        fn stop_bits(&self) -> StopBits {
            match self.stop_bits {
                2 => StopBits::Two,
                _ => StopBits::One,
            }
        }
    }

    #[async_trait]
    impl Transport for SerialTransport {
        async fn connect(&mut self, deadline: Duration) -> Result<(), TransportError> {
            let builder = tokio_serial::new(&self.port, self.baud)
                .data_bits(self.data_bits())
                .parity(self.parity())
                .stop_bits(self.stop_bits())
                .timeout(deadline);

            match tokio::time::timeout(deadline, async { builder.open_native_async() }).await {
                Ok(Ok(stream)) => {
                    self.stream = Some(stream);
                    Ok(())
                }
                Ok(Err(e)) => Err(TransportError::Unreachable(format!("{}: {e}", self.port))),
                Err(_) => Err(TransportError::HandshakeTimeout(deadline)),
            }
        }

        async fn read_exact(
            &mut self,
            buf: &mut [u8],
            deadline: Duration,
        ) -> Result<(), TransportError> {
            let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
            tokio::time::timeout(deadline, stream.read_exact(buf))
                .await
                .map_err(|_| TransportError::HandshakeTimeout(deadline))?
                .map_err(TransportError::Io)?;
            Ok(())
        }

        async fn write_all(&mut self, buf: &[u8], deadline: Duration) -> Result<(), TransportError> {
            let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
            tokio::time::timeout(deadline, stream.write_all(buf))
                .await
                .map_err(|_| TransportError::HandshakeTimeout(deadline))?
                .map_err(TransportError::Io)?;
            Ok(())
        }

        async fn close(&mut self) {
            // Dropping the handle releases the port lock; there is no
            // async close in tokio-serial.
            self.stream = None;
        }

        fn is_connected(&self) -> bool {
            self.stream.is_some()
        }
    }
}

#[cfg(feature = "serial")]
pub use imp::SerialTransport;

#[cfg(not(feature = "serial"))]
pub struct SerialTransport;
