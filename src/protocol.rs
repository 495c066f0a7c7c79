pub mod commands;
pub mod jt1078;
pub mod jt808;

// JT808 message ids arriving from the device leg.
pub const MSG_TERMINAL_RESPONSE: u16 = 0x0001;
pub const MSG_HEARTBEAT: u16 = 0x0002;
pub const MSG_TERMINAL_REGISTER: u16 = 0x0100;
pub const MSG_TERMINAL_AUTH: u16 = 0x0102;
pub const MSG_LOCATION_REPORT: u16 = 0x0200;
pub const MSG_LOCATION_BATCH: u16 = 0x0704;
pub const MSG_MULTIMEDIA_UPLOAD: u16 = 0x0801;
pub const MSG_CAMERA_RESPONSE: u16 = 0x0805;

// Ids originated by the platform or by the proxy itself.
pub const MSG_PLATFORM_RESPONSE: u16 = 0x8001;
pub const MSG_REGISTER_RESPONSE: u16 = 0x8100;
pub const MSG_SET_PARAMETERS: u16 = 0x8103;
pub const MSG_MULTIMEDIA_ACK: u16 = 0x8800;
pub const MSG_IMAGE_CAPTURE: u16 = 0x8801;
pub const MSG_MEDIA_START: u16 = 0x9101;
pub const MSG_MEDIA_CONTROL: u16 = 0x9102;

/// Auth code handed to devices in the proxy's 0x8100 registration response.
pub const AUTH_CODE: &[u8] = b"bsjgps";
