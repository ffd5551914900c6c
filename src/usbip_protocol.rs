use crate::error::{Result, UsbIpError};
use crate::util::{from_fixed_field, to_fixed_field};
use crate::*;
use num_traits::FromPrimitive;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// A fixed-size record of the USB/IP wire format
pub trait WireRecord: Sized {
    /// Encoded size in bytes
    const SIZE: usize;
    /// Record name used in error messages
    const NAME: &'static str;

    /// Append the encoded record to `out`
    fn pack(&self, out: &mut Vec<u8>);

    /// Decode the record from the start of `buf`
    ///
    /// Fails with [UsbIpError::MalformedPdu] if `buf` is shorter than [Self::SIZE].
    fn unpack(buf: &[u8]) -> Result<Self>;

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        self.pack(&mut out);
        out
    }
}

/// Bounds-checked big-endian reader over one record
struct Fields<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Fields<'a> {
    fn new<R: WireRecord>(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < R::SIZE {
            return Err(UsbIpError::short(R::NAME, R::SIZE, buf.len()));
        }
        Ok(Self {
            buf: &buf[..R::SIZE],
            pos: 0,
        })
    }

    fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u8(&mut self) -> u8 {
        self.array::<1>()[0]
    }

    fn u16(&mut self) -> u16 {
        u16::from_be_bytes(self.array())
    }

    fn u32(&mut self) -> u32 {
        u32::from_be_bytes(self.array())
    }

    fn i32(&mut self) -> i32 {
        i32::from_be_bytes(self.array())
    }

    fn skip(&mut self, len: usize) {
        self.pos += len;
    }
}

/// Common header of every OP PDU
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpCommon {
    pub version: u16,
    pub code: u16,
    pub status: u32,
}

impl OpCommon {
    pub fn reply(code: u16, status: u32) -> Self {
        Self {
            version: USBIP_VERSION,
            code,
            status,
        }
    }
}

impl WireRecord for OpCommon {
    const SIZE: usize = 8;
    const NAME: &'static str = "op_common";

    fn pack(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.code.to_be_bytes());
        out.extend_from_slice(&self.status.to_be_bytes());
    }

    fn unpack(buf: &[u8]) -> Result<Self> {
        let mut f = Fields::new::<Self>(buf)?;
        Ok(Self {
            version: f.u16(),
            code: f.u16(),
            status: f.u32(),
        })
    }
}

impl WireRecord for InterfaceDescriptor {
    const SIZE: usize = 4;
    const NAME: &'static str = "usbip_usb_interface";

    fn pack(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[
            self.interface_class,
            self.interface_subclass,
            self.interface_protocol,
            0, // padding
        ]);
    }

    fn unpack(buf: &[u8]) -> Result<Self> {
        let mut f = Fields::new::<Self>(buf)?;
        Ok(Self {
            interface_class: f.u8(),
            interface_subclass: f.u8(),
            interface_protocol: f.u8(),
        })
    }
}

/// The fixed device record; interfaces are not part of it
impl WireRecord for DeviceDescriptor {
    const SIZE: usize = 312;
    const NAME: &'static str = "usbip_usb_device";

    fn pack(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&to_fixed_field::<SYSFS_PATH_MAX>(&self.path));
        out.extend_from_slice(&to_fixed_field::<SYSFS_BUS_ID_SIZE>(&self.bus_id));
        out.extend_from_slice(&self.bus_num.to_be_bytes());
        out.extend_from_slice(&self.dev_num.to_be_bytes());
        out.extend_from_slice(&self.speed.to_be_bytes());
        out.extend_from_slice(&self.vendor_id.to_be_bytes());
        out.extend_from_slice(&self.product_id.to_be_bytes());
        out.extend_from_slice(&self.device_bcd.to_be_bytes());
        out.extend_from_slice(&[
            self.device_class,
            self.device_subclass,
            self.device_protocol,
            self.configuration_value,
            self.num_configurations,
            self.num_interfaces,
        ]);
    }

    fn unpack(buf: &[u8]) -> Result<Self> {
        let mut f = Fields::new::<Self>(buf)?;
        let path = from_fixed_field(&f.array::<SYSFS_PATH_MAX>());
        let bus_id = from_fixed_field(&f.array::<SYSFS_BUS_ID_SIZE>());
        Ok(Self {
            path,
            bus_id,
            bus_num: f.u32(),
            dev_num: f.u32(),
            speed: f.u32(),
            vendor_id: f.u16(),
            product_id: f.u16(),
            device_bcd: f.u16(),
            device_class: f.u8(),
            device_subclass: f.u8(),
            device_protocol: f.u8(),
            configuration_value: f.u8(),
            num_configurations: f.u8(),
            num_interfaces: f.u8(),
            interfaces: Vec::new(),
        })
    }
}

/// Append a device record followed by its interface records, as in OP_REP_DEVLIST
pub fn pack_devlist_entry(device: &DeviceDescriptor, out: &mut Vec<u8>) {
    device.pack(out);
    for interface in device
        .interfaces
        .iter()
        .take(device.num_interfaces as usize)
    {
        interface.pack(out);
    }
}

/// Decode one OP_REP_DEVLIST entry, returning it with the number of bytes consumed
pub fn unpack_devlist_entry(buf: &[u8]) -> Result<(DeviceDescriptor, usize)> {
    let mut device = DeviceDescriptor::unpack(buf)?;
    let mut offset = DeviceDescriptor::SIZE;
    for _ in 0..device.num_interfaces {
        let interface = InterfaceDescriptor::unpack(&buf[offset.min(buf.len())..])?;
        device.interfaces.push(interface);
        offset += InterfaceDescriptor::SIZE;
    }
    Ok((device, offset))
}

/// Body header of OP_REP_DEVLIST
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DevlistReplyHeader {
    pub ndev: u32,
}

impl WireRecord for DevlistReplyHeader {
    const SIZE: usize = 4;
    const NAME: &'static str = "op_devlist_reply";

    fn pack(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.ndev.to_be_bytes());
    }

    fn unpack(buf: &[u8]) -> Result<Self> {
        let mut f = Fields::new::<Self>(buf)?;
        Ok(Self { ndev: f.u32() })
    }
}

/// Body of OP_REQ_IMPORT and OP_REQ_DEVINFO
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImportRequest {
    pub busid: [u8; SYSFS_BUS_ID_SIZE],
}

impl ImportRequest {
    pub fn new(bus_id: &str) -> Self {
        Self {
            busid: to_fixed_field(bus_id),
        }
    }

    pub fn bus_id(&self) -> String {
        from_fixed_field(&self.busid)
    }
}

impl WireRecord for ImportRequest {
    const SIZE: usize = SYSFS_BUS_ID_SIZE;
    const NAME: &'static str = "op_import_request";

    fn pack(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.busid);
    }

    fn unpack(buf: &[u8]) -> Result<Self> {
        let mut f = Fields::new::<Self>(buf)?;
        Ok(Self { busid: f.array() })
    }
}

/// Fields shared by every URB PDU
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsbIpHeaderBasic {
    pub command: u32,
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
}

impl UsbIpHeaderBasic {
    pub fn direction(&self) -> Option<Direction> {
        Direction::from_u32(self.direction)
    }

    /// Endpoint address as seen by the device, with the IN bit set for IN transfers
    pub fn endpoint_address(&self) -> u8 {
        let ep = (self.ep & 0x0f) as u8;
        if self.direction == USBIP_DIR_IN {
            ep | 0x80
        } else {
            ep
        }
    }

    /// The same header answering with `command`
    pub fn reply(&self, command: u16) -> Self {
        Self {
            command: command.into(),
            ..*self
        }
    }
}

impl WireRecord for UsbIpHeaderBasic {
    const SIZE: usize = 20;
    const NAME: &'static str = "usbip_header_basic";

    fn pack(&self, out: &mut Vec<u8>) {
        for field in [
            self.command,
            self.seqnum,
            self.devid,
            self.direction,
            self.ep,
        ] {
            out.extend_from_slice(&field.to_be_bytes());
        }
    }

    fn unpack(buf: &[u8]) -> Result<Self> {
        let mut f = Fields::new::<Self>(buf)?;
        Ok(Self {
            command: f.u32(),
            seqnum: f.u32(),
            devid: f.u32(),
            direction: f.u32(),
            ep: f.u32(),
        })
    }
}

/// Size of every URB header, whatever its command
pub const USBIP_HEADER_SIZE: usize = 48;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CmdSubmitHeader {
    pub header: UsbIpHeaderBasic,
    pub transfer_flags: u32,
    pub transfer_buffer_length: i32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub interval: i32,
    pub setup: [u8; 8],
}

impl CmdSubmitHeader {
    /// Number of isochronous packet descriptors following the payload
    pub fn iso_packets(&self) -> usize {
        // non-isochronous transfers carry 0 or 0xffffffff here
        if self.number_of_packets > 0 {
            self.number_of_packets as usize
        } else {
            0
        }
    }
}

impl WireRecord for CmdSubmitHeader {
    const SIZE: usize = USBIP_HEADER_SIZE;
    const NAME: &'static str = "usbip_header_cmd_submit";

    fn pack(&self, out: &mut Vec<u8>) {
        self.header.pack(out);
        out.extend_from_slice(&self.transfer_flags.to_be_bytes());
        for field in [
            self.transfer_buffer_length,
            self.start_frame,
            self.number_of_packets,
            self.interval,
        ] {
            out.extend_from_slice(&field.to_be_bytes());
        }
        out.extend_from_slice(&self.setup);
    }

    fn unpack(buf: &[u8]) -> Result<Self> {
        let mut f = Fields::new::<Self>(buf)?;
        f.skip(UsbIpHeaderBasic::SIZE);
        Ok(Self {
            header: UsbIpHeaderBasic::unpack(buf)?,
            transfer_flags: f.u32(),
            transfer_buffer_length: f.i32(),
            start_frame: f.i32(),
            number_of_packets: f.i32(),
            interval: f.i32(),
            setup: f.array(),
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetSubmitHeader {
    pub header: UsbIpHeaderBasic,
    pub status: i32,
    pub actual_length: i32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub error_count: i32,
}

impl WireRecord for RetSubmitHeader {
    const SIZE: usize = USBIP_HEADER_SIZE;
    const NAME: &'static str = "usbip_header_ret_submit";

    fn pack(&self, out: &mut Vec<u8>) {
        self.header.pack(out);
        for field in [
            self.status,
            self.actual_length,
            self.start_frame,
            self.number_of_packets,
            self.error_count,
        ] {
            out.extend_from_slice(&field.to_be_bytes());
        }
        out.extend_from_slice(&[0u8; 8]);
    }

    fn unpack(buf: &[u8]) -> Result<Self> {
        let mut f = Fields::new::<Self>(buf)?;
        f.skip(UsbIpHeaderBasic::SIZE);
        Ok(Self {
            header: UsbIpHeaderBasic::unpack(buf)?,
            status: f.i32(),
            actual_length: f.i32(),
            start_frame: f.i32(),
            number_of_packets: f.i32(),
            error_count: f.i32(),
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CmdUnlinkHeader {
    pub header: UsbIpHeaderBasic,
    pub unlink_seqnum: u32,
}

impl WireRecord for CmdUnlinkHeader {
    const SIZE: usize = USBIP_HEADER_SIZE;
    const NAME: &'static str = "usbip_header_cmd_unlink";

    fn pack(&self, out: &mut Vec<u8>) {
        self.header.pack(out);
        out.extend_from_slice(&self.unlink_seqnum.to_be_bytes());
        out.extend_from_slice(&[0u8; 24]);
    }

    fn unpack(buf: &[u8]) -> Result<Self> {
        let mut f = Fields::new::<Self>(buf)?;
        f.skip(UsbIpHeaderBasic::SIZE);
        Ok(Self {
            header: UsbIpHeaderBasic::unpack(buf)?,
            unlink_seqnum: f.u32(),
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetUnlinkHeader {
    pub header: UsbIpHeaderBasic,
    pub status: i32,
}

impl WireRecord for RetUnlinkHeader {
    const SIZE: usize = USBIP_HEADER_SIZE;
    const NAME: &'static str = "usbip_header_ret_unlink";

    fn pack(&self, out: &mut Vec<u8>) {
        self.header.pack(out);
        out.extend_from_slice(&self.status.to_be_bytes());
        out.extend_from_slice(&[0u8; 24]);
    }

    fn unpack(buf: &[u8]) -> Result<Self> {
        let mut f = Fields::new::<Self>(buf)?;
        f.skip(UsbIpHeaderBasic::SIZE);
        Ok(Self {
            header: UsbIpHeaderBasic::unpack(buf)?,
            status: f.i32(),
        })
    }
}

/// A PDU sent by a USB/IP client
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UsbIpCommand {
    OpReqDevlist {
        version: u16,
        status: u32,
    },
    OpReqImport {
        version: u16,
        status: u32,
        busid: [u8; SYSFS_BUS_ID_SIZE],
    },
    OpReqDevinfo {
        version: u16,
        status: u32,
        busid: [u8; SYSFS_BUS_ID_SIZE],
    },
    OpReqExport {
        version: u16,
        status: u32,
        device: DeviceDescriptor,
    },
    OpReqUnexport {
        version: u16,
        status: u32,
        device: DeviceDescriptor,
    },
    /// OP PDU with a code this server cannot frame; its body was not read
    OpReqUnknown {
        version: u16,
        code: u16,
        status: u32,
    },
    UsbIpCmdSubmit {
        header: CmdSubmitHeader,
        data: Vec<u8>,
        iso_packet_descriptor: Vec<u8>,
    },
    UsbIpCmdUnlink {
        header: CmdUnlinkHeader,
    },
}

impl UsbIpCommand {
    /// Version carried by OP PDUs; URB PDUs have none
    pub fn version(&self) -> Option<u16> {
        match self {
            Self::OpReqDevlist { version, .. }
            | Self::OpReqImport { version, .. }
            | Self::OpReqDevinfo { version, .. }
            | Self::OpReqExport { version, .. }
            | Self::OpReqUnexport { version, .. }
            | Self::OpReqUnknown { version, .. } => Some(*version),
            Self::UsbIpCmdSubmit { .. } | Self::UsbIpCmdUnlink { .. } => None,
        }
    }

    /// OP code of the request, or the URB command
    pub fn code(&self) -> u16 {
        match self {
            Self::OpReqDevlist { .. } => OP_REQ_DEVLIST,
            Self::OpReqImport { .. } => OP_REQ_IMPORT,
            Self::OpReqDevinfo { .. } => OP_REQ_DEVINFO,
            Self::OpReqExport { .. } => OP_REQ_EXPORT,
            Self::OpReqUnexport { .. } => OP_REQ_UNEXPORT,
            Self::OpReqUnknown { code, .. } => *code,
            Self::UsbIpCmdSubmit { .. } => USBIP_CMD_SUBMIT,
            Self::UsbIpCmdUnlink { .. } => USBIP_CMD_UNLINK,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::OpReqDevlist { .. } => "OP_REQ_DEVLIST",
            Self::OpReqImport { .. } => "OP_REQ_IMPORT",
            Self::OpReqDevinfo { .. } => "OP_REQ_DEVINFO",
            Self::OpReqExport { .. } => "OP_REQ_EXPORT",
            Self::OpReqUnexport { .. } => "OP_REQ_UNEXPORT",
            Self::OpReqUnknown { .. } => "unknown OP request",
            Self::UsbIpCmdSubmit { .. } => "USBIP_CMD_SUBMIT",
            Self::UsbIpCmdUnlink { .. } => "USBIP_CMD_UNLINK",
        }
    }

    /// Read one PDU, accepting CMD_SUBMIT payloads up to [DEFAULT_MAX_TRANSFER_LENGTH]
    pub async fn read_from_socket<T: AsyncReadExt + Unpin>(socket: &mut T) -> Result<Self> {
        Self::read_from_socket_with_limit(socket, DEFAULT_MAX_TRANSFER_LENGTH).await
    }

    /// Read one PDU, refusing CMD_SUBMIT payloads longer than `max_transfer_length`
    pub async fn read_from_socket_with_limit<T: AsyncReadExt + Unpin>(
        socket: &mut T,
        max_transfer_length: usize,
    ) -> Result<Self> {
        let mut header = [0u8; USBIP_HEADER_SIZE];
        socket.read_exact(&mut header[..2]).await?;
        let version = u16::from_be_bytes([header[0], header[1]]);

        if version != 0 {
            // OP PDUs start with a non-zero version, URB PDUs with the
            // zero high half of their command word
            socket.read_exact(&mut header[2..OpCommon::SIZE]).await?;
            let common = OpCommon::unpack(&header)?;
            return Ok(match common.code {
                OP_REQ_DEVLIST => Self::OpReqDevlist {
                    version,
                    status: common.status,
                },
                OP_REQ_IMPORT => Self::OpReqImport {
                    version,
                    status: common.status,
                    busid: read_record::<ImportRequest, _>(socket).await?.busid,
                },
                OP_REQ_DEVINFO => Self::OpReqDevinfo {
                    version,
                    status: common.status,
                    busid: read_record::<ImportRequest, _>(socket).await?.busid,
                },
                OP_REQ_EXPORT => Self::OpReqExport {
                    version,
                    status: common.status,
                    device: read_record(socket).await?,
                },
                OP_REQ_UNEXPORT => Self::OpReqUnexport {
                    version,
                    status: common.status,
                    device: read_record(socket).await?,
                },
                code => Self::OpReqUnknown {
                    version,
                    code,
                    status: common.status,
                },
            });
        }

        socket.read_exact(&mut header[2..]).await?;
        let basic = UsbIpHeaderBasic::unpack(&header)?;
        match UsbIpCommandCode::from_u32(basic.command) {
            Some(UsbIpCommandCode::CmdSubmit) => {
                let header = CmdSubmitHeader::unpack(&header)?;
                let direction = header.header.direction().ok_or(UsbIpError::InvalidField {
                    field: "direction",
                    value: header.header.direction.into(),
                })?;
                let length = checked_length(
                    "transfer_buffer_length",
                    header.transfer_buffer_length,
                    max_transfer_length,
                )?;
                let mut data = vec![];
                if direction == Direction::Out {
                    data.resize(length, 0);
                    socket.read_exact(&mut data).await?;
                }
                let iso_len = header
                    .iso_packets()
                    .checked_mul(ISO_PACKET_DESCRIPTOR_SIZE)
                    .filter(|len| *len <= max_transfer_length)
                    .ok_or(UsbIpError::InvalidField {
                        field: "number_of_packets",
                        value: header.number_of_packets.into(),
                    })?;
                let mut iso_packet_descriptor = vec![0; iso_len];
                socket.read_exact(&mut iso_packet_descriptor).await?;
                Ok(Self::UsbIpCmdSubmit {
                    header,
                    data,
                    iso_packet_descriptor,
                })
            }
            Some(UsbIpCommandCode::CmdUnlink) => Ok(Self::UsbIpCmdUnlink {
                header: CmdUnlinkHeader::unpack(&header)?,
            }),
            _ => Err(UsbIpError::UnknownOpcode(basic.command)),
        }
    }

    /// Encode the PDU as a client would send it
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![];
        match self {
            Self::OpReqDevlist { version, status } => OpCommon {
                version: *version,
                code: OP_REQ_DEVLIST,
                status: *status,
            }
            .pack(&mut out),
            Self::OpReqImport {
                version,
                status,
                busid,
            }
            | Self::OpReqDevinfo {
                version,
                status,
                busid,
            } => {
                OpCommon {
                    version: *version,
                    code: self.code(),
                    status: *status,
                }
                .pack(&mut out);
                out.extend_from_slice(busid);
            }
            Self::OpReqExport {
                version,
                status,
                device,
            }
            | Self::OpReqUnexport {
                version,
                status,
                device,
            } => {
                OpCommon {
                    version: *version,
                    code: self.code(),
                    status: *status,
                }
                .pack(&mut out);
                device.pack(&mut out);
            }
            Self::OpReqUnknown {
                version,
                code,
                status,
            } => OpCommon {
                version: *version,
                code: *code,
                status: *status,
            }
            .pack(&mut out),
            Self::UsbIpCmdSubmit {
                header,
                data,
                iso_packet_descriptor,
            } => {
                header.pack(&mut out);
                out.extend_from_slice(data);
                out.extend_from_slice(iso_packet_descriptor);
            }
            Self::UsbIpCmdUnlink { header } => header.pack(&mut out),
        }
        out
    }
}

async fn read_record<R: WireRecord, T: AsyncReadExt + Unpin>(socket: &mut T) -> Result<R> {
    let mut buf = vec![0u8; R::SIZE];
    socket.read_exact(&mut buf).await?;
    R::unpack(&buf)
}

fn checked_length(field: &'static str, value: i32, max: usize) -> Result<usize> {
    usize::try_from(value)
        .ok()
        .filter(|len| *len <= max)
        .ok_or(UsbIpError::InvalidField {
            field,
            value: value.into(),
        })
}

/// A PDU sent by the server
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UsbIpResponse {
    OpRepDevlist {
        devices: Vec<DeviceDescriptor>,
    },
    OpRepImport {
        status: u32,
        device: Option<DeviceDescriptor>,
    },
    /// A bare common header, used for refusals and errors
    OpRepStatus {
        code: u16,
        status: u32,
    },
    OpRepExport {
        code: u16,
        status: u32,
        returncode: i32,
    },
    UsbIpRetSubmit {
        header: RetSubmitHeader,
        data: Vec<u8>,
        iso_packet_descriptor: Vec<u8>,
    },
    UsbIpRetUnlink {
        header: RetUnlinkHeader,
    },
}

impl UsbIpResponse {
    pub fn op_rep_devlist(devices: &[DeviceDescriptor]) -> Self {
        Self::OpRepDevlist {
            devices: devices.to_vec(),
        }
    }

    pub fn op_rep_import_success(device: &DeviceDescriptor) -> Self {
        Self::OpRepImport {
            status: ST_OK,
            device: Some(device.without_interfaces()),
        }
    }

    pub fn op_rep_import_fail(status: u32) -> Self {
        Self::OpRepImport {
            status,
            device: None,
        }
    }

    pub fn op_rep_status(code: u16, status: u32) -> Self {
        Self::OpRepStatus { code, status }
    }

    pub fn usbip_ret_submit_success(
        header: &UsbIpHeaderBasic,
        actual_length: i32,
        data: Vec<u8>,
        iso_packet_descriptor: Vec<u8>,
    ) -> Self {
        Self::UsbIpRetSubmit {
            header: RetSubmitHeader {
                header: header.reply(USBIP_RET_SUBMIT),
                actual_length,
                ..Default::default()
            },
            data,
            iso_packet_descriptor,
        }
    }

    /// RET_SUBMIT carrying a negative errno and no data
    pub fn usbip_ret_submit_fail(header: &UsbIpHeaderBasic, errno: i32) -> Self {
        Self::UsbIpRetSubmit {
            header: RetSubmitHeader {
                header: header.reply(USBIP_RET_SUBMIT),
                status: -errno.abs(),
                ..Default::default()
            },
            data: vec![],
            iso_packet_descriptor: vec![],
        }
    }

    pub fn usbip_ret_unlink(header: &UsbIpHeaderBasic, status: i32) -> Self {
        Self::UsbIpRetUnlink {
            header: RetUnlinkHeader {
                header: header.reply(USBIP_RET_UNLINK),
                status,
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::OpRepDevlist { .. } => "OP_REP_DEVLIST",
            Self::OpRepImport { .. } => "OP_REP_IMPORT",
            Self::OpRepStatus { .. } => "OP_REP status",
            Self::OpRepExport { .. } => "OP_REP_EXPORT",
            Self::UsbIpRetSubmit { .. } => "USBIP_RET_SUBMIT",
            Self::UsbIpRetUnlink { .. } => "USBIP_RET_UNLINK",
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![];
        match self {
            Self::OpRepDevlist { devices } => {
                OpCommon::reply(OP_REP_DEVLIST, ST_OK).pack(&mut out);
                DevlistReplyHeader {
                    ndev: devices.len() as u32,
                }
                .pack(&mut out);
                for device in devices {
                    pack_devlist_entry(device, &mut out);
                }
            }
            Self::OpRepImport { status, device } => {
                OpCommon::reply(OP_REP_IMPORT, *status).pack(&mut out);
                if let (ST_OK, Some(device)) = (*status, device) {
                    device.pack(&mut out);
                }
            }
            Self::OpRepStatus { code, status } => OpCommon::reply(*code, *status).pack(&mut out),
            Self::OpRepExport {
                code,
                status,
                returncode,
            } => {
                OpCommon::reply(*code, *status).pack(&mut out);
                out.extend_from_slice(&returncode.to_be_bytes());
            }
            Self::UsbIpRetSubmit {
                header,
                data,
                iso_packet_descriptor,
            } => {
                header.pack(&mut out);
                out.extend_from_slice(data);
                out.extend_from_slice(iso_packet_descriptor);
            }
            Self::UsbIpRetUnlink { header } => header.pack(&mut out),
        }
        out
    }

    pub async fn write_to_socket<T: AsyncWriteExt + Unpin>(&self, socket: &mut T) -> Result<()> {
        socket.write_all(&self.to_bytes()).await?;
        Ok(())
    }
}
