use std::io::prelude::*;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use crc::{Crc, CRC_16_MODBUS};

use super::Transport;
use crate::error::{Error, Result};

const RTU_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

const START: u8 = 0xA5;
const END: u8 = 0x15;
const HEADER_LENGTH: usize = 11;
const READ_HOLDING_REGISTERS: u8 = 0x03;

/// Modbus RTU frames wrapped in the Solarman V5 envelope spoken by Wi-Fi logging sticks.
///
/// The connection is kept between requests. After any failed exchange it is dropped and the
/// next request opens a fresh one, so a late reply can never be taken for the answer to a
/// later request.
pub struct SolarmanTransport {
    addr: SocketAddr,
    stream: Option<TcpStream>,
    connect_timeout: Duration,
    read_timeout: Duration,
    logger_serial: u32,
    unit: u8,
    sequence: u16,
}

impl SolarmanTransport {
    pub fn new(
        addr: SocketAddr,
        logger_serial: Option<u32>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> std::io::Result<Self> {
        let stream = create_connection(addr, connect_timeout, read_timeout)?;
        let mut transport = SolarmanTransport {
            addr,
            stream: Some(stream),
            connect_timeout,
            read_timeout,
            logger_serial: logger_serial.unwrap_or(0),
            unit: 1,
            sequence: 0,
        };
        if logger_serial.is_none() {
            transport.detect_serial()?;
        }
        Ok(transport)
    }

    /// Asks the stick with an empty frame, it answers with its own serial in the header.
    fn detect_serial(&mut self) -> std::io::Result<()> {
        let response = self.exchange(&[]).map_err(|error| match error {
            Error::Transport(error) => error,
            Error::ReadTimeout(timeout) => std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("logger did not answer within {timeout:?}"),
            ),
            other => std::io::Error::other(other.to_string()),
        })?;
        self.logger_serial = response.logger_serial;
        log::info!("Detected logger serial {}", self.logger_serial);
        Ok(())
    }

    fn exchange(&mut self, rtu_frame: &[u8]) -> Result<Response> {
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => {
                log::info!("Reconnecting to logger at {}", self.addr);
                create_connection(self.addr, self.connect_timeout, self.read_timeout).map_err(
                    |source| Error::Connect {
                        target: format!("solarman {}", self.addr),
                        timeout: self.connect_timeout,
                        source,
                    },
                )?
            }
        };
        self.sequence = self.sequence.wrapping_add(1);
        let request = Request {
            sequence: self.sequence,
            logger_serial: self.logger_serial,
            rtu_frame,
        };
        log::debug!("Sending request: {request:?}");
        let response = transact(&mut stream, &request)
            .map_err(|error| error.timed_out_after(self.read_timeout))?;
        log::debug!("Received response: {response:?}");
        self.stream = Some(stream);
        Ok(response)
    }
}

fn create_connection(
    addr: SocketAddr,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> std::io::Result<TcpStream> {
    let stream = TcpStream::connect_timeout(&addr, connect_timeout)?;
    stream.set_read_timeout(Some(read_timeout))?;
    stream.set_write_timeout(Some(read_timeout))?;
    Ok(stream)
}

/// Sends one request and reads back the reply to exactly that request.
fn transact(stream: &mut TcpStream, request: &Request<'_>) -> Result<Response> {
    stream.write_all(&request.to_bytes())?;

    let mut header = [0; HEADER_LENGTH];
    stream.read_exact(&mut header)?;
    if header[0] != START {
        return Err(Error::malformed(format!(
            "solarman frame starts with {:#04x}",
            header[0]
        )));
    }
    let length = usize::from(u16::from_le_bytes([header[1], header[2]]));
    let mut rest = vec![0; length + 2];
    stream.read_exact(&mut rest)?;

    let response = Response::from_bytes(&header, &rest)?;
    // the logger echoes the low byte of the request sequence
    let expected = request.sequence.to_le_bytes()[0];
    if response.sequence != expected {
        return Err(Error::malformed(format!(
            "reply to request {:#04x} while waiting for {expected:#04x}",
            response.sequence
        )));
    }
    Ok(response)
}

impl Transport for SolarmanTransport {
    fn select_unit(&mut self, unit: u8) {
        self.unit = unit;
    }

    fn read_holding_registers(&mut self, start: u16, count: u16) -> Result<Vec<u8>> {
        let frame = read_request(self.unit, start, count);
        let response = self.exchange(&frame)?;
        if response.status != 0x01 {
            log::debug!("Logger reported status {:#04x}", response.status);
        }
        parse_read_response(self.unit, count, &response.rtu_frame)
    }
}

#[derive(Debug)]
struct Request<'a> {
    sequence: u16,
    logger_serial: u32,
    rtu_frame: &'a [u8],
}

impl Request<'_> {
    fn to_bytes(&self) -> Vec<u8> {
        let payload_length = u16::try_from(15 + self.rtu_frame.len()).unwrap_or(u16::MAX);
        let mut bytes = Vec::with_capacity(HEADER_LENGTH + usize::from(payload_length) + 2);
        bytes.push(START);
        bytes.extend(payload_length.to_le_bytes());
        bytes.extend([0x10, 0x45]);
        bytes.extend(self.sequence.to_le_bytes());
        bytes.extend(self.logger_serial.to_le_bytes());

        // frame type "solar inverter", sensor type and three zeroed time counters
        bytes.push(0x02);
        bytes.extend([0; 2 + 4 + 4 + 4]);
        bytes.extend(self.rtu_frame);

        bytes.push(checksum(&bytes[1..]));
        bytes.push(END);
        bytes
    }
}

#[derive(Debug)]
struct Response {
    sequence: u8,
    logger_serial: u32,
    status: u8,
    rtu_frame: Vec<u8>,
}

impl Response {
    /// `rest` is everything after the header: payload, checksum and end byte.
    fn from_bytes(header: &[u8; HEADER_LENGTH], rest: &[u8]) -> Result<Self> {
        let [payload @ .., sum, end] = rest else {
            return Err(Error::malformed("solarman frame without trailer"));
        };
        if *end != END {
            return Err(Error::malformed(format!(
                "solarman frame ends with {end:#04x}"
            )));
        }
        let expected = checksum(&header[1..]).wrapping_add(checksum(payload));
        if *sum != expected {
            return Err(Error::malformed(format!(
                "solarman checksum {sum:#04x}, expected {expected:#04x}"
            )));
        }
        if payload.len() < 14 {
            return Err(Error::malformed(format!(
                "solarman payload of {} bytes is too short",
                payload.len()
            )));
        }
        Ok(Response {
            sequence: header[5],
            logger_serial: u32::from_le_bytes([header[7], header[8], header[9], header[10]]),
            status: payload[1],
            rtu_frame: payload[14..].to_vec(),
        })
    }
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0_u8, |sum, byte| sum.wrapping_add(*byte))
}

fn with_crc(mut frame: Vec<u8>) -> Vec<u8> {
    let crc = RTU_CRC.checksum(&frame);
    frame.extend(crc.to_le_bytes());
    frame
}

fn read_request(unit: u8, start: u16, count: u16) -> Vec<u8> {
    let mut frame = vec![unit, READ_HOLDING_REGISTERS];
    frame.extend(start.to_be_bytes());
    frame.extend(count.to_be_bytes());
    with_crc(frame)
}

/// Validates an RTU read response and returns its register bytes.
fn parse_read_response(unit: u8, count: u16, frame: &[u8]) -> Result<Vec<u8>> {
    let [body @ .., crc_low, crc_high] = frame else {
        return Err(Error::malformed("empty rtu frame"));
    };
    let crc = u16::from_le_bytes([*crc_low, *crc_high]);
    if body.len() < 3 || RTU_CRC.checksum(body) != crc {
        return Err(Error::malformed(format!("rtu frame {frame:02x?} fails crc")));
    }
    if body[0] != unit {
        return Err(Error::malformed(format!(
            "response from unit {} while talking to unit {unit}",
            body[0]
        )));
    }
    match body[1] {
        READ_HOLDING_REGISTERS => {}
        code if code == READ_HOLDING_REGISTERS | 0x80 => {
            return Err(Error::Exception {
                unit,
                reason: format!("code {:#04x}", body[2]),
            })
        }
        code => {
            return Err(Error::malformed(format!(
                "unexpected function code {code:#04x}"
            )))
        }
    }
    let data = &body[3..];
    if usize::from(body[2]) != data.len() || data.len() != usize::from(count) * 2 {
        return Err(Error::malformed(format!(
            "expected {count} registers, byte count says {} and frame holds {}",
            body[2],
            data.len()
        )));
    }
    Ok(data.to_vec())
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    use super::*;
    use crate::block::Block;
    use crate::decoder::{FieldMap, FieldSpec};
    use crate::query::Bus;

    fn response_frame(sequence: u8, logger_serial: u32, rtu_frame: &[u8]) -> Vec<u8> {
        let mut bytes = vec![START];
        bytes.extend(u16::try_from(14 + rtu_frame.len()).unwrap().to_le_bytes());
        bytes.extend([0x10, 0x15, sequence, 0x00]);
        bytes.extend(logger_serial.to_le_bytes());
        bytes.extend([0x02, 0x01]);
        bytes.extend([0; 12]);
        bytes.extend(rtu_frame);
        bytes.push(checksum(&bytes[1..]));
        bytes.push(END);
        bytes
    }

    fn register_reply(sequence: u8, unit: u8, word: u16) -> Vec<u8> {
        let mut rtu = vec![unit, READ_HOLDING_REGISTERS, 0x02];
        rtu.extend(word.to_be_bytes());
        response_frame(sequence, 0xCAFE, &with_crc(rtu))
    }

    /// Reads one request on the logger side and returns its sequence byte.
    fn receive_request(stream: &mut TcpStream) -> u8 {
        let mut header = [0; HEADER_LENGTH];
        stream.read_exact(&mut header).unwrap();
        let length = usize::from(u16::from_le_bytes([header[1], header[2]]));
        let mut rest = vec![0; length + 2];
        stream.read_exact(&mut rest).unwrap();
        assert_eq!(rest[rest.len() - 1], END);
        header[5]
    }

    /// Accepts a connection and answers the serial detection request on it.
    fn accept_detection(listener: &TcpListener) -> TcpStream {
        let (mut stream, _) = listener.accept().unwrap();
        let sequence = receive_request(&mut stream);
        stream.write_all(&response_frame(sequence, 0xCAFE, &[])).unwrap();
        stream
    }

    #[test]
    fn read_request_matches_known_frame() {
        assert_eq!(
            read_request(1, 0x3b, 0x36),
            [0x01, 0x03, 0x00, 0x3b, 0x00, 0x36, 0xb4, 0x11]
        );
    }

    #[test]
    fn request_envelope() {
        let frame = read_request(1, 0x3b, 0x36);
        let bytes = Request {
            sequence: 0x0102,
            logger_serial: 0x1234_5678,
            rtu_frame: &frame,
        }
        .to_bytes();
        assert_eq!(bytes.len(), HEADER_LENGTH + 15 + frame.len() + 2);
        assert_eq!(bytes[..3], [START, 23, 0]);
        assert_eq!(bytes[5..7], [0x02, 0x01]);
        assert_eq!(bytes[7..11], [0x78, 0x56, 0x34, 0x12]);
        assert_eq!(bytes[bytes.len() - 1], END);
        assert_eq!(bytes[bytes.len() - 2], checksum(&bytes[1..bytes.len() - 2]));
    }

    #[test]
    fn response_envelope_checks() {
        let rtu = with_crc(vec![0x01, 0x03, 0x02, 0x00, 0x2A]);
        let bytes = response_frame(9, 42, &rtu);
        let header: [u8; HEADER_LENGTH] = bytes[..HEADER_LENGTH].try_into().unwrap();
        let response = Response::from_bytes(&header, &bytes[HEADER_LENGTH..]).unwrap();
        assert_eq!(response.sequence, 9);
        assert_eq!(response.logger_serial, 42);
        assert_eq!(response.status, 1);
        assert_eq!(response.rtu_frame, rtu);

        let mut corrupted = bytes.clone();
        corrupted[HEADER_LENGTH + 3] ^= 0xFF;
        assert!(Response::from_bytes(&header, &corrupted[HEADER_LENGTH..]).is_err());
    }

    #[test]
    fn rtu_response_validation() {
        let good = with_crc(vec![0x30, 0x03, 0x04, 0x00, 0x04, 0x00, 0x23]);
        assert_eq!(parse_read_response(0x30, 2, &good).unwrap(), [0, 4, 0, 0x23]);
        assert!(parse_read_response(0x31, 2, &good).is_err());
        assert!(parse_read_response(0x30, 3, &good).is_err());

        let mut bad_crc = good.clone();
        bad_crc[4] = 0xFF;
        assert!(parse_read_response(0x30, 2, &bad_crc).is_err());

        let exception = with_crc(vec![0x30, 0x83, 0x02]);
        assert!(matches!(
            parse_read_response(0x30, 2, &exception),
            Err(Error::Exception { unit: 0x30, .. })
        ));
    }

    #[test]
    fn reads_through_a_logger() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let logger = thread::spawn(move || {
            let mut stream = accept_detection(&listener);
            let sequence = receive_request(&mut stream);
            let rtu = with_crc(vec![0x07, 0x03, 0x04, 0x12, 0x34, 0xAB, 0xCD]);
            stream.write_all(&response_frame(sequence, 0xCAFE, &rtu)).unwrap();
        });

        let timeout = Duration::from_secs(5);
        let mut transport = SolarmanTransport::new(addr, None, timeout, timeout).unwrap();
        assert_eq!(transport.logger_serial, 0xCAFE);
        transport.select_unit(7);
        assert_eq!(
            transport.read_holding_registers(100, 2).unwrap(),
            [0x12, 0x34, 0xAB, 0xCD]
        );
        logger.join().unwrap();
    }

    #[test]
    fn silent_logger_is_fatal_and_its_late_reply_is_never_used() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (timed_out_tx, timed_out_rx) = mpsc::channel();
        let logger = thread::spawn(move || {
            let mut first = accept_detection(&listener);
            let sequence = receive_request(&mut first);
            // stay silent until the client has given up, then answer anyway
            timed_out_rx.recv().unwrap();
            let _ = first.write_all(&register_reply(sequence, 1, 0x1111));

            let (mut second, _) = listener.accept().unwrap();
            let sequence = receive_request(&mut second);
            second.write_all(&register_reply(sequence, 1, 0x2222)).unwrap();
        });

        let read_timeout = Duration::from_millis(200);
        let transport =
            SolarmanTransport::new(addr, None, Duration::from_secs(5), read_timeout).unwrap();
        let bus = Bus::new(Box::new(transport), Duration::from_secs(5));
        let block = Block::new(
            "status",
            100,
            101,
            FieldMap::from([("status".to_owned(), FieldSpec::U16 { register: 100 })]),
        )
        .unwrap();

        let error = bus.query(1, &[block.clone()]).unwrap_err();
        assert!(matches!(error, Error::ReadTimeout(timeout) if timeout == read_timeout));
        assert!(error.is_fatal());
        timed_out_tx.send(()).unwrap();

        assert_eq!(bus.read_block(1, block.range).unwrap(), [0x22, 0x22]);
        logger.join().unwrap();
    }

    #[test]
    fn reply_to_an_earlier_request_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let logger = thread::spawn(move || {
            let mut stream = accept_detection(&listener);
            let sequence = receive_request(&mut stream);
            stream
                .write_all(&register_reply(sequence.wrapping_sub(1), 1, 0x1111))
                .unwrap();
        });

        let timeout = Duration::from_secs(5);
        let mut transport = SolarmanTransport::new(addr, None, timeout, timeout).unwrap();
        let result = transport.read_holding_registers(100, 1);
        assert!(matches!(result, Err(Error::Transport(_))));
        assert!(transport.stream.is_none());
        logger.join().unwrap();
    }
}
