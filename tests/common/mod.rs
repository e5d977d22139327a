#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use avrboot_rs::cmd::DfuRequest;
use avrboot_rs::{
    DfuConnector, DfuState, DfuStatus, DfuTransport, FlashError, HidConnector, HidProtocol,
    HidTransport, TargetDescriptor,
};

type Result<T> = std::result::Result<T, FlashError>;

/// One request seen by a mock DFU transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    Out {
        request: DfuRequest,
        value: u16,
        data: Vec<u8>,
    },
    In {
        request: DfuRequest,
        value: u16,
        length: usize,
    },
    Reset,
}

impl Transfer {
    pub fn request(&self) -> Option<DfuRequest> {
        match self {
            Transfer::Out { request, .. } | Transfer::In { request, .. } => Some(*request),
            Transfer::Reset => None,
        }
    }
}

/// Raw GETSTATUS reply.
pub fn status(status: DfuStatus, state: DfuState) -> Vec<u8> {
    vec![status as u8, 0, 0, 0, state as u8, 0]
}

pub fn idle() -> Vec<u8> {
    status(DfuStatus::Ok, DfuState::DfuIdle)
}

#[derive(Debug, Default)]
pub struct DfuLog {
    pub transfers: Vec<Transfer>,
    /// GETSTATUS replies, consumed in order; an OK/dfuIDLE reply once empty.
    pub statuses: VecDeque<Vec<u8>>,
    /// UPLOAD replies, consumed in order; zeros once empty.
    pub uploads: VecDeque<Vec<u8>>,
    /// DNLOAD to fail with a pipe error, counted from 0.
    pub fail_download: Option<usize>,
    pub opened: usize,
    /// Device lookups made through the connector.
    pub polls: usize,
    pub released: usize,
}

impl DfuLog {
    pub fn count(&self, request: DfuRequest) -> usize {
        self.transfers
            .iter()
            .filter(|t| t.request() == Some(request))
            .count()
    }

    /// Payloads of every DNLOAD, in order.
    pub fn downloads(&self) -> Vec<Vec<u8>> {
        self.transfers
            .iter()
            .filter_map(|t| match t {
                Transfer::Out {
                    request: DfuRequest::Dnload,
                    data,
                    ..
                } => Some(data.clone()),
                _ => None,
            })
            .collect()
    }
}

/// DFU transport recording every request into a shared log.
#[derive(Debug)]
pub struct MockDfu {
    pub log: Rc<RefCell<DfuLog>>,
}

impl MockDfu {
    pub fn new() -> (Self, Rc<RefCell<DfuLog>>) {
        let log = Rc::new(RefCell::new(DfuLog::default()));
        (MockDfu { log: log.clone() }, log)
    }
}

impl Drop for MockDfu {
    fn drop(&mut self) {
        self.log.borrow_mut().released += 1;
    }
}

impl DfuTransport for MockDfu {
    fn control_out(&mut self, request: DfuRequest, value: u16, data: &[u8]) -> Result<()> {
        let mut log = self.log.borrow_mut();
        let failing = request == DfuRequest::Dnload
            && log.fail_download == Some(log.count(DfuRequest::Dnload));
        log.transfers.push(Transfer::Out {
            request,
            value,
            data: data.to_vec(),
        });
        if failing {
            return Err(FlashError::UsbTransferFailure(rusb::Error::Pipe));
        }
        Ok(())
    }

    fn control_in(&mut self, request: DfuRequest, value: u16, length: usize) -> Result<Vec<u8>> {
        let mut log = self.log.borrow_mut();
        log.transfers.push(Transfer::In {
            request,
            value,
            length,
        });
        Ok(match request {
            DfuRequest::GetStatus => log.statuses.pop_front().unwrap_or_else(idle),
            DfuRequest::GetState => vec![DfuState::DfuIdle as u8],
            _ => log
                .uploads
                .pop_front()
                .unwrap_or_else(|| vec![0; length]),
        })
    }

    fn reset(&mut self) -> Result<()> {
        self.log.borrow_mut().transfers.push(Transfer::Reset);
        Ok(())
    }
}

/// Connector handing out [`MockDfu`] transports sharing one log.
#[derive(Debug)]
pub struct MockDfuConnector {
    pub log: Rc<RefCell<DfuLog>>,
    pub attached: bool,
}

impl MockDfuConnector {
    pub fn new() -> (Self, Rc<RefCell<DfuLog>>) {
        let log = Rc::new(RefCell::new(DfuLog::default()));
        (
            MockDfuConnector {
                log: log.clone(),
                attached: true,
            },
            log,
        )
    }
}

impl DfuConnector for MockDfuConnector {
    type Transport = MockDfu;

    fn open(&mut self, _target: &TargetDescriptor) -> Result<MockDfu> {
        if !self.attached {
            return Err(FlashError::DeviceNotFound);
        }
        self.log.borrow_mut().opened += 1;
        Ok(MockDfu {
            log: self.log.clone(),
        })
    }

    fn find(&mut self, _vendor_id: u16, _product_id: u16) -> Result<Option<String>> {
        self.log.borrow_mut().polls += 1;
        Ok(self.attached.then(|| "ATm32U4DFU".to_string()))
    }
}

/// One report seen by a mock HID transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    SendFeature { id: u8, data: Vec<u8> },
    ReceiveFeature { id: u8, length: usize },
    Output { id: u8, data: Vec<u8> },
}

#[derive(Debug, Default)]
pub struct HidLog {
    pub reports: Vec<Report>,
    /// Last feature report 2 sent, echoed back on receive.
    pub echo: Vec<u8>,
    /// Byte to corrupt in the echo of the nth page write, counted from 0.
    pub corrupt: Option<(usize, usize)>,
    pub pages_echoed: usize,
    pub version: u8,
    pub released: usize,
}

/// HID transport echoing page data back, optionally corrupted.
#[derive(Debug)]
pub struct MockHid {
    pub log: Rc<RefCell<HidLog>>,
}

impl Drop for MockHid {
    fn drop(&mut self) {
        self.log.borrow_mut().released += 1;
    }
}

impl HidTransport for MockHid {
    fn send_feature_report(&mut self, report_id: u8, data: &[u8]) -> Result<()> {
        let mut log = self.log.borrow_mut();
        if report_id == 2 {
            log.echo = data.to_vec();
        }
        if report_id == 1 {
            let version = log.version;
            log.echo = vec![version; data.len()];
        }
        log.reports.push(Report::SendFeature {
            id: report_id,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn receive_feature_report(&mut self, report_id: u8, length: usize) -> Result<Vec<u8>> {
        let mut log = self.log.borrow_mut();
        log.reports.push(Report::ReceiveFeature {
            id: report_id,
            length,
        });
        let mut data = log.echo.clone();
        if let Some((page, offset)) = log.corrupt {
            if page == log.pages_echoed {
                data[offset] ^= 0xFF;
            }
        }
        log.pages_echoed += 1;
        Ok(data)
    }

    fn send(&mut self, report_id: u8, data: &[u8]) -> Result<()> {
        self.log.borrow_mut().reports.push(Report::Output {
            id: report_id,
            data: data.to_vec(),
        });
        Ok(())
    }
}

#[derive(Debug)]
pub struct MockHidConnector {
    pub log: Rc<RefCell<HidLog>>,
    /// Whether the device's report descriptor declares report ids.
    pub report_ids: bool,
}

impl MockHidConnector {
    pub fn new() -> (Self, Rc<RefCell<HidLog>>) {
        let log = Rc::new(RefCell::new(HidLog::default()));
        (
            MockHidConnector {
                log: log.clone(),
                report_ids: true,
            },
            log,
        )
    }
}

impl HidConnector for MockHidConnector {
    type Transport = MockHid;

    fn connect(&mut self, _vendor_id: u16, _product_id: u16) -> Result<(MockHid, HidProtocol)> {
        let protocol = if self.report_ids {
            HidProtocol::V1
        } else {
            HidProtocol::V0
        };
        let transport = MockHid {
            log: self.log.clone(),
        };
        Ok((transport, protocol))
    }

    fn find(&mut self, _vendor_id: u16, _product_id: u16) -> Result<Option<String>> {
        Ok(Some("HIDBoot".to_string()))
    }
}

/// Intel HEX text placing `data` at `address`, 16 bytes per record.
pub fn hex_image(address: u32, data: &[u8]) -> String {
    let mut out = String::new();
    let mut upper = None;
    for (i, chunk) in data.chunks(16).enumerate() {
        let at = address + (i * 16) as u32;
        let high = (at >> 16) as u16;
        if upper != Some(high) {
            out.push_str(&record(0, 0x04, &high.to_be_bytes()));
            upper = Some(high);
        }
        out.push_str(&record(at as u16, 0x00, chunk));
    }
    out.push_str(":00000001FF\n");
    out
}

fn record(offset: u16, kind: u8, data: &[u8]) -> String {
    let mut bytes = vec![data.len() as u8];
    bytes.extend_from_slice(&offset.to_be_bytes());
    bytes.push(kind);
    bytes.extend_from_slice(data);
    let sum = bytes.iter().fold(0u8, |a, b| a.wrapping_add(*b));
    bytes.push(sum.wrapping_neg());

    let mut line = String::from(":");
    for b in bytes {
        line.push_str(&format!("{:02X}", b));
    }
    line.push('\n');
    line
}
