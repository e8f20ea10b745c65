//! JTAG ICE mkII protocol constants and helpers
//!
//! Numbering follows Atmel application note AVR067.

/// Frame start byte
pub const MESSAGE_START: u8 = 0x1B;
/// Token byte following the length field
pub const TOKEN: u8 = 0x0E;
/// Largest payload the ICE will ever send
pub const MAX_MESSAGE: usize = 100_000;
/// Sequence number reserved for asynchronous events
pub const EVENT_SEQ: u16 = 0xFFFF;

// Commands
/// End the session
pub const CMND_SIGN_OFF: u8 = 0x00;
/// Request the sign-on string
pub const CMND_GET_SIGN_ON: u8 = 0x01;
/// Set a parameter
pub const CMND_SET_PARAMETER: u8 = 0x02;
/// Read a parameter
pub const CMND_GET_PARAMETER: u8 = 0x03;
/// Write memory
pub const CMND_WRITE_MEMORY: u8 = 0x04;
/// Read memory
pub const CMND_READ_MEMORY: u8 = 0x05;
/// Let the target run
pub const CMND_GO: u8 = 0x08;
/// Stop the target
pub const CMND_FORCED_STOP: u8 = 0x0A;
/// Reset the target
pub const CMND_RESET: u8 = 0x0B;
/// Ship the classic device descriptor
pub const CMND_SET_DEVICE_DESCRIPTOR: u8 = 0x0C;
/// Synchronise with the ICE
pub const CMND_GET_SYNC: u8 = 0x0F;
/// Classic chip erase
pub const CMND_CHIP_ERASE: u8 = 0x13;
/// STK500v2 ISP command wrapped for the ICE
pub const CMND_ISP_PACKET: u8 = 0x2F;
/// Enter programming mode
pub const CMND_ENTER_PROGMODE: u8 = 0x14;
/// Leave programming mode
pub const CMND_LEAVE_PROGMODE: u8 = 0x15;
/// XMEGA erase with an erase kind
pub const CMND_XMEGA_ERASE: u8 = 0x34;
/// Ship the XMEGA parameter block
pub const CMND_SET_XMEGA_PARAMS: u8 = 0x36;

// Responses
/// Command accepted
pub const RSP_OK: u8 = 0x80;
/// Parameter value follows
pub const RSP_PARAMETER: u8 = 0x81;
/// Memory contents follow
pub const RSP_MEMORY: u8 = 0x82;
/// Sign-on data follows
pub const RSP_SIGN_ON: u8 = 0x86;
/// Wrapped STK500v2 answer follows
pub const RSP_SPI_DATA: u8 = 0x88;
/// Generic failure
pub const RSP_FAILED: u8 = 0xA0;
/// Target reports no power
pub const RSP_NO_TARGET_POWER: u8 = 0xAB;
/// JTAG ID mismatch, usually JTAGEN unprogrammed
pub const RSP_ILLEGAL_JTAG_ID: u8 = 0xA9;

const FAILURE_NAMES: [&str; 14] = [
    "RSP_FAILED",
    "RSP_ILLEGAL_PARAMETER",
    "RSP_ILLEGAL_MEMORY_TYPE",
    "RSP_ILLEGAL_MEMORY_RANGE",
    "RSP_ILLEGAL_EMULATOR_MODE",
    "RSP_ILLEGAL_MCU_STATE",
    "RSP_ILLEGAL_VALUE",
    "RSP_SET_N_PARAMETERS",
    "RSP_ILLEGAL_BREAKPOINT",
    "RSP_ILLEGAL_JTAG_ID",
    "RSP_ILLEGAL_COMMAND",
    "RSP_NO_TARGET_POWER",
    "RSP_DEBUGWIRE_SYNC_FAILED",
    "RSP_ILLEGAL_POWER_STATE",
];

/// Name of a response code for messages
pub fn rsp_name(code: u8) -> &'static str {
    match code {
        RSP_OK => "RSP_OK",
        RSP_PARAMETER => "RSP_PARAMETER",
        RSP_MEMORY => "RSP_MEMORY",
        RSP_SIGN_ON => "RSP_SIGN_ON",
        RSP_SPI_DATA => "RSP_SPI_DATA",
        0xA0..=0xAD => FAILURE_NAMES[usize::from(code - 0xA0)],
        _ => "unknown response",
    }
}

// Parameters
/// Hardware version (1 byte)
pub const PAR_HW_VERSION: u8 = 0x01;
/// Firmware version (4 bytes)
pub const PAR_FW_VERSION: u8 = 0x02;
/// Emulator mode
pub const PAR_EMULATOR_MODE: u8 = 0x03;
/// Serial baud rate code
pub const PAR_BAUD_RATE: u8 = 0x05;
/// Target voltage in mV
pub const PAR_OCD_VTARGET: u8 = 0x06;
/// JTAG clock divider
pub const PAR_OCD_JTAG_CLK: u8 = 0x07;
/// Target timers run while stopped
pub const PAR_TIMERS_RUNNING: u8 = 0x09;
/// Hold reset while entering programming mode
pub const PAR_EXTERNAL_RESET: u8 = 0x13;
/// JTAG daisy chain position
pub const PAR_DAISY_CHAIN_INFO: u8 = 0x1B;
/// Target signature cached by the ICE
pub const PAR_TARGET_SIGNATURE: u8 = 0x1D;
/// Start of the PDI address window (old firmware)
pub const PAR_PDI_OFFSET_START: u8 = 0x32;
/// End of the PDI address window (old firmware)
pub const PAR_PDI_OFFSET_END: u8 = 0x33;

/// Payload size of a SET_PARAMETER value
pub fn parm_size(parm: u8) -> Option<usize> {
    match parm {
        PAR_HW_VERSION | PAR_OCD_VTARGET => Some(2),
        PAR_FW_VERSION | PAR_DAISY_CHAIN_INFO | PAR_PDI_OFFSET_START | PAR_PDI_OFFSET_END => {
            Some(4)
        }
        PAR_EMULATOR_MODE
        | PAR_BAUD_RATE
        | PAR_OCD_JTAG_CLK
        | PAR_TIMERS_RUNNING
        | PAR_EXTERNAL_RESET => Some(1),
        _ => None,
    }
}

// Emulator modes
/// debugWIRE
pub const EMULATOR_MODE_DEBUGWIRE: u8 = 0x00;
/// Classic JTAG
pub const EMULATOR_MODE_JTAG: u8 = 0x01;
/// ISP through the SPI pins
pub const EMULATOR_MODE_SPI: u8 = 0x03;
/// XMEGA over JTAG
pub const EMULATOR_MODE_JTAG_XMEGA: u8 = 0x05;
/// PDI
pub const EMULATOR_MODE_PDI: u8 = 0x06;

// Memory types
/// Data space
pub const MTYPE_SRAM: u8 = 0x20;
/// Byte-wise EEPROM
pub const MTYPE_EEPROM: u8 = 0x22;
/// Flash through SPM
pub const MTYPE_SPM: u8 = 0xA0;
/// Paged flash (classic)
pub const MTYPE_FLASH_PAGE: u8 = 0xB0;
/// Paged EEPROM (classic)
pub const MTYPE_EEPROM_PAGE: u8 = 0xB1;
/// Fuses
pub const MTYPE_FUSE_BITS: u8 = 0xB2;
/// Lock bits
pub const MTYPE_LOCK_BITS: u8 = 0xB3;
/// Signature over JTAG
pub const MTYPE_SIGN_JTAG: u8 = 0xB4;
/// Oscillator calibration byte
pub const MTYPE_OSCCAL_BYTE: u8 = 0xB5;
/// Application flash (XMEGA)
pub const MTYPE_FLASH: u8 = 0xC0;
/// Boot flash (XMEGA)
pub const MTYPE_BOOT_FLASH: u8 = 0xC1;
/// EEPROM (XMEGA)
pub const MTYPE_EEPROM_XMEGA: u8 = 0xC4;
/// User signature row
pub const MTYPE_USERSIG: u8 = 0xC5;
/// Production signature row
pub const MTYPE_PRODSIG: u8 = 0xC6;

// STK500v2 commands carried by CMND_ISP_PACKET
/// Enter ISP programming mode
pub const ISP_ENTER_PROGMODE: u8 = 0x10;
/// Leave ISP programming mode
pub const ISP_LEAVE_PROGMODE: u8 = 0x11;
/// Raw SPI exchange
pub const ISP_SPI_MULTI: u8 = 0x1D;
/// STK500v2 success status
pub const ISP_STATUS_OK: u8 = 0x00;

// XMEGA erase kinds
/// Whole chip
pub const XMEGA_ERASE_CHIP: u8 = 0;
/// Application section page
pub const XMEGA_ERASE_APP_PAGE: u8 = 4;
/// Boot section page
pub const XMEGA_ERASE_BOOT_PAGE: u8 = 5;
/// EEPROM page
pub const XMEGA_ERASE_EEPROM_PAGE: u8 = 6;
/// User signature row
pub const XMEGA_ERASE_USERSIG: u8 = 7;

/// Offset of the data space in XMEGA flat addressing
pub const DATA_OFFSET: u32 = 0x100_0000;

/// Hardware version reported by an AVR Dragon
pub const HW_VERSION_DRAGON: u8 = 0x0B;

/// USB vendor ID (Atmel)
pub const USB_VENDOR_ATMEL: u16 = 0x03EB;
/// USB product ID of the JTAG ICE mkII
pub const USB_DEVICE_JTAGICEMKII: u16 = 0x2103;
/// USB product ID of the AVR Dragon
pub const USB_DEVICE_AVRDRAGON: u16 = 0x2107;
/// Bulk OUT endpoint
pub const USB_WRITE_EP: u8 = 0x02;
/// Bulk IN endpoint
pub const USB_READ_EP: u8 = 0x82;
/// Bulk packet size
pub const USB_MAX_XFER: usize = 64;

const BAUD_CODES: [(u32, u8); 20] = [
    (2400, 1),
    (4800, 2),
    (9600, 3),
    (19200, 4),
    (38400, 5),
    (57600, 6),
    (115200, 7),
    (14400, 8),
    (153600, 9),
    (230400, 10),
    (460800, 11),
    (921600, 12),
    (128000, 13),
    (256000, 14),
    (320000, 15),
    (640000, 16),
    (1000000, 17),
    (1500000, 18),
    (2000000, 19),
    (3000000, 20),
];

/// Code for PAR_BAUD_RATE, if the ICE knows the rate
pub fn baud_code(baud: u32) -> Option<u8> {
    BAUD_CODES.iter().find(|(b, _)| *b == baud).map(|(_, c)| *c)
}

/// JTAG clock divider for a bit clock period in seconds
pub fn jtag_clock_code(period: f64) -> u8 {
    let f = 1.0 / period;
    if f >= 6.4e6 {
        0
    } else if f >= 2.8e6 {
        1
    } else if f >= 20.9e3 {
        (5.35e6 / f) as u8
    } else {
        255
    }
}

/// Bit clock period in seconds for a JTAG clock divider
pub fn jtag_clock_period(code: u8) -> f64 {
    match code {
        0 => 1.0 / 6.4e6,
        1 => 1.0 / 2.8e6,
        n => f64::from(n) / 5.35e6,
    }
}

/// CRC-16 over a frame (reflected CCITT polynomial, initial value 0xFFFF)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &b in data {
        crc ^= u16::from(b);
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0x8408 } else { crc >> 1 };
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0x6F91);
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn test_baud_codes() {
        assert_eq!(baud_code(19200), Some(4));
        assert_eq!(baud_code(14400), Some(8));
        assert_eq!(baud_code(3000000), Some(20));
        assert_eq!(baud_code(12345), None);
    }

    #[test]
    fn test_jtag_clock() {
        assert_eq!(jtag_clock_code(1.0 / 8e6), 0);
        assert_eq!(jtag_clock_code(1.0 / 3e6), 1);
        assert_eq!(jtag_clock_code(1.0 / 1e6), 5);
        assert_eq!(jtag_clock_code(1.0 / 10e3), 255);
        assert!((jtag_clock_period(5) - 1.0 / 1.07e6).abs() < 1e-9);
    }

    #[test]
    fn test_response_names() {
        assert_eq!(rsp_name(0xA0), "RSP_FAILED");
        assert_eq!(rsp_name(0xAD), "RSP_ILLEGAL_POWER_STATE");
        assert_eq!(rsp_name(0x86), "RSP_SIGN_ON");
        assert_eq!(rsp_name(0x42), "unknown response");
    }
}
