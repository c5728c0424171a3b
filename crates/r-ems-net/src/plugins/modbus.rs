//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Built-in protocol plugins and the static plugin catalog."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! `modbus-tcp` driver backed by an in-memory register bank.
//!
//! Tag addresses take the form `slave!NXXXXX`: `N` selects the area (0 coil, 1 discrete
//! input, 3 input register, 4 holding register) and `XXXXX` is the 1-based address.
//! Multi-register values are stored big-endian, high word first.

use std::collections::HashMap;

use r_ems_adapter::metrics::{RECV_BYTES, SEND_BYTES};
use r_ems_adapter::{AdapterCallbacks, DriverPlugin, Plugin, PluginError, PluginResult, PollContext};
use r_ems_msg::{DataType, ErrorCode, LinkState, Tag, TagAttribute, Value};
use serde::Deserialize;
use tracing::{debug, info};

/// Bytes of a read request frame (MBAP header plus PDU).
const REQUEST_FRAME_LEN: u64 = 12;
/// Bytes of a read response frame before the register payload.
const RESPONSE_HEADER_LEN: u64 = 9;

/// Connection setting of a modbus node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModbusSetting {
    pub host: String,
    pub port: u16,
    /// Response timeout in milliseconds.
    pub timeout: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Area {
    Coil,
    DiscreteInput,
    InputRegister,
    HoldingRegister,
}

impl Area {
    fn from_digit(digit: char) -> Option<Self> {
        match digit {
            '0' => Some(Area::Coil),
            '1' => Some(Area::DiscreteInput),
            '3' => Some(Area::InputRegister),
            '4' => Some(Area::HoldingRegister),
            _ => None,
        }
    }

    fn is_bit(self) -> bool {
        matches!(self, Area::Coil | Area::DiscreteInput)
    }

    fn is_writable(self) -> bool {
        matches!(self, Area::Coil | Area::HoldingRegister)
    }
}

/// Decoded tag address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModbusPoint {
    pub slave: u8,
    pub area: Area,
    /// Zero-based start address.
    pub start: u16,
    /// Registers (or bits) covered by the tag.
    pub count: u16,
}

impl ModbusPoint {
    /// Parse and type-check the address of `tag`.
    pub fn parse(tag: &Tag) -> Result<Self, ErrorCode> {
        let (slave, rest) = tag
            .address
            .split_once('!')
            .ok_or(ErrorCode::TagAddressFormatInvalid)?;
        let slave: u8 = slave.parse().map_err(|_| ErrorCode::TagAddressFormatInvalid)?;
        let mut chars = rest.chars();
        let area = chars
            .next()
            .and_then(Area::from_digit)
            .ok_or(ErrorCode::TagAddressFormatInvalid)?;
        let address: u32 = chars
            .as_str()
            .parse()
            .map_err(|_| ErrorCode::TagAddressFormatInvalid)?;
        if !(1..=65_536).contains(&address) {
            return Err(ErrorCode::TagAddressFormatInvalid);
        }

        let count = register_count(area, tag.data_type)?;
        let start = address - 1;
        if start + u32::from(count) > 65_536 {
            return Err(ErrorCode::TagAddressFormatInvalid);
        }
        if tag.attribute.contains(TagAttribute::WRITE) && !area.is_writable() {
            return Err(ErrorCode::TagAttributeNotSupport);
        }
        Ok(Self {
            slave,
            area,
            start: u16::try_from(start).map_err(|_| ErrorCode::TagAddressFormatInvalid)?,
            count,
        })
    }
}

fn register_count(area: Area, data_type: DataType) -> Result<u16, ErrorCode> {
    match (area.is_bit(), data_type) {
        (true, DataType::Bit | DataType::Bool) => Ok(1),
        (true, _) => Err(ErrorCode::TagTypeNotSupport),
        (false, DataType::Int8 | DataType::Uint8 | DataType::Int16 | DataType::Uint16) => Ok(1),
        (false, DataType::Int32 | DataType::Uint32 | DataType::Float) => Ok(2),
        (false, DataType::Int64 | DataType::Uint64 | DataType::Double) => Ok(4),
        (false, DataType::Bit | DataType::Bool | DataType::String) => {
            Err(ErrorCode::TagTypeNotSupport)
        }
    }
}

/// Simulated device memory, one 16-bit word per (slave, area, address).
#[derive(Debug, Default, Clone)]
pub struct RegisterBank {
    words: HashMap<(u8, Area, u16), u16>,
}

impl RegisterBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `count` words from `start`. Unset words read as zero.
    pub fn read_words(&self, slave: u8, area: Area, start: u16, count: u16) -> Vec<u16> {
        (0..count)
            .map(|offset| {
                let address = start.wrapping_add(offset);
                self.words.get(&(slave, area, address)).copied().unwrap_or(0)
            })
            .collect()
    }

    pub fn write_words(&mut self, slave: u8, area: Area, start: u16, words: &[u16]) {
        for (offset, word) in words.iter().enumerate() {
            let address = start.wrapping_add(offset as u16);
            self.words.insert((slave, area, address), *word);
        }
    }

    /// Decode the value of a tag at `point`.
    pub fn read(&self, point: &ModbusPoint, data_type: DataType) -> Value {
        let words = self.read_words(point.slave, point.area, point.start, point.count);
        let raw = words.iter().fold(0u64, |acc, w| (acc << 16) | u64::from(*w));
        decode_value(raw, data_type)
    }

    /// Encode and store `value` for a tag at `point`.
    pub fn write(&mut self, point: &ModbusPoint, data_type: DataType, value: &Value) -> Result<(), ErrorCode> {
        let raw = encode_value(data_type, value)?;
        let words: Vec<u16> = (0..point.count)
            .map(|k| (raw >> (16 * u32::from(point.count - 1 - k))) as u16)
            .collect();
        self.write_words(point.slave, point.area, point.start, &words);
        Ok(())
    }
}

fn decode_value(raw: u64, data_type: DataType) -> Value {
    match data_type {
        DataType::Int8 => Value::Int(i64::from(raw as u8 as i8)),
        DataType::Uint8 => Value::Int(i64::from(raw as u8)),
        DataType::Int16 => Value::Int(i64::from(raw as u16 as i16)),
        DataType::Uint16 => Value::Int(i64::from(raw as u16)),
        DataType::Int32 => Value::Int(i64::from(raw as u32 as i32)),
        DataType::Uint32 => Value::Int(i64::from(raw as u32)),
        DataType::Int64 => Value::Int(raw as i64),
        DataType::Uint64 => match i64::try_from(raw) {
            Ok(v) => Value::Int(v),
            Err(_) => Value::Error(ErrorCode::TagValueInvalid),
        },
        DataType::Float => Value::Float(f64::from(f32::from_bits(raw as u32))),
        DataType::Double => Value::Float(f64::from_bits(raw)),
        DataType::Bit => Value::Int(i64::from(raw & 1 == 1)),
        DataType::Bool => Value::Bool(raw & 1 == 1),
        DataType::String => Value::Error(ErrorCode::TagTypeNotSupport),
    }
}

fn encode_value(data_type: DataType, value: &Value) -> Result<u64, ErrorCode> {
    let invalid = |_| ErrorCode::TagValueInvalid;
    match (data_type, value) {
        (DataType::Bit | DataType::Bool, Value::Bool(b)) => Ok(u64::from(*b)),
        (DataType::Bit | DataType::Bool, Value::Int(i @ (0 | 1))) => Ok(*i as u64),
        (DataType::Float, Value::Float(f)) => Ok(u64::from((*f as f32).to_bits())),
        (DataType::Float, Value::Int(i)) => Ok(u64::from((*i as f32).to_bits())),
        (DataType::Double, Value::Float(f)) => Ok(f.to_bits()),
        (DataType::Double, Value::Int(i)) => Ok((*i as f64).to_bits()),
        (DataType::Int8, Value::Int(i)) => i8::try_from(*i).map(|v| u64::from(v as u8)).map_err(invalid),
        (DataType::Uint8, Value::Int(i)) => u8::try_from(*i).map(u64::from).map_err(invalid),
        (DataType::Int16, Value::Int(i)) => {
            i16::try_from(*i).map(|v| u64::from(v as u16)).map_err(invalid)
        }
        (DataType::Uint16, Value::Int(i)) => u16::try_from(*i).map(u64::from).map_err(invalid),
        (DataType::Int32, Value::Int(i)) => {
            i32::try_from(*i).map(|v| u64::from(v as u32)).map_err(invalid)
        }
        (DataType::Uint32, Value::Int(i)) => u32::try_from(*i).map(u64::from).map_err(invalid),
        (DataType::Int64, Value::Int(i)) => Ok(*i as u64),
        (DataType::Uint64, Value::Int(i)) => u64::try_from(*i).map_err(invalid),
        _ => Err(ErrorCode::TagValueInvalid),
    }
}

/// The `modbus-tcp` plugin instance.
#[derive(Debug, Default)]
pub struct ModbusDriver {
    setting: Option<ModbusSetting>,
    bank: RegisterBank,
}

impl ModbusDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn setting(&self) -> Option<&ModbusSetting> {
        self.setting.as_ref()
    }

    pub fn bank(&self) -> &RegisterBank {
        &self.bank
    }

    pub fn bank_mut(&mut self) -> &mut RegisterBank {
        &mut self.bank
    }
}

impl Plugin for ModbusDriver {
    fn start(&mut self, cb: &AdapterCallbacks) -> PluginResult<()> {
        let Some(setting) = &self.setting else {
            return Err(ErrorCode::NodeNotReady.into());
        };
        info!(host = %setting.host, port = setting.port, "modbus connection up");
        cb.set_link(LinkState::Connected);
        Ok(())
    }

    fn stop(&mut self, cb: &AdapterCallbacks) -> PluginResult<()> {
        cb.set_link(LinkState::Disconnected);
        Ok(())
    }

    fn apply_setting(&mut self, cb: &AdapterCallbacks, setting: &str) -> PluginResult<()> {
        let parsed: ModbusSetting = serde_json::from_str(setting).map_err(|err| {
            PluginError::new(ErrorCode::NodeSettingInvalid, format!("modbus setting: {err}"))
        })?;
        if parsed.host.is_empty() || parsed.port == 0 {
            return Err(PluginError::new(
                ErrorCode::NodeSettingInvalid,
                "modbus setting needs a host and a non-zero port",
            ));
        }
        info!(
            host = %parsed.host,
            port = parsed.port,
            timeout_ms = parsed.timeout,
            "modbus setting applied"
        );
        if self.setting.replace(parsed).is_some() {
            cb.set_link(LinkState::Disconnected);
        }
        Ok(())
    }

    fn as_driver(&mut self) -> Option<&mut dyn DriverPlugin> {
        Some(self)
    }
}

impl DriverPlugin for ModbusDriver {
    fn validate_tag(&mut self, tag: &Tag) -> Result<(), ErrorCode> {
        let point = ModbusPoint::parse(tag)?;
        debug!(tag = %tag.name, slave = point.slave, area = ?point.area, start = point.start, "tag validated");
        Ok(())
    }

    fn poll_group(&mut self, cb: &AdapterCallbacks, ctx: &mut PollContext<'_>) -> PluginResult<()> {
        if cb.link() != LinkState::Connected {
            for name in ctx.tags().keys() {
                ctx.set_value(name, Value::Error(ErrorCode::PluginDisconnected));
            }
            return Ok(());
        }
        let mut sent = 0;
        let mut received = 0;
        for (name, tag) in ctx.tags() {
            let value = match ModbusPoint::parse(tag) {
                Ok(point) => {
                    sent += REQUEST_FRAME_LEN;
                    received += RESPONSE_HEADER_LEN + 2 * u64::from(point.count);
                    self.bank.read(&point, tag.data_type)
                }
                Err(code) => Value::Error(code),
            };
            ctx.set_value(name, value);
        }
        cb.update_metric(SEND_BYTES, sent);
        cb.update_metric(RECV_BYTES, received);
        Ok(())
    }

    fn write_tag(&mut self, cb: &AdapterCallbacks, tag: &Tag, value: &Value) -> Result<(), ErrorCode> {
        let point = ModbusPoint::parse(tag)?;
        if !point.area.is_writable() {
            return Err(ErrorCode::TagAttributeNotSupport);
        }
        if cb.link() != LinkState::Connected {
            return Err(ErrorCode::PluginDisconnected);
        }
        self.bank.write(&point, tag.data_type, value)?;
        cb.update_metric(SEND_BYTES, REQUEST_FRAME_LEN + 1 + 2 * u64::from(point.count));
        cb.update_metric(RECV_BYTES, REQUEST_FRAME_LEN);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::test_support::{callbacks, poll};
    use r_ems_msg::NodeType;

    fn tag(address: &str, data_type: DataType, attribute: TagAttribute) -> Tag {
        Tag::new("t", address, data_type, attribute)
    }

    #[test]
    fn addresses_are_parsed_and_type_checked() {
        let point = ModbusPoint::parse(&tag("1!400010", DataType::Float, TagAttribute::READ)).unwrap();
        assert_eq!(point.slave, 1);
        assert_eq!(point.area, Area::HoldingRegister);
        assert_eq!(point.start, 9);
        assert_eq!(point.count, 2);

        let cases = [
            ("1400001", DataType::Int16, TagAttribute::READ, ErrorCode::TagAddressFormatInvalid),
            ("1!200001", DataType::Int16, TagAttribute::READ, ErrorCode::TagAddressFormatInvalid),
            ("1!400000", DataType::Int16, TagAttribute::READ, ErrorCode::TagAddressFormatInvalid),
            ("300!400001", DataType::Int16, TagAttribute::READ, ErrorCode::TagAddressFormatInvalid),
            ("1!465536", DataType::Int32, TagAttribute::READ, ErrorCode::TagAddressFormatInvalid),
            ("1!000001", DataType::Int16, TagAttribute::READ, ErrorCode::TagTypeNotSupport),
            ("1!400001", DataType::String, TagAttribute::READ, ErrorCode::TagTypeNotSupport),
            ("1!300001", DataType::Int16, TagAttribute::READ_WRITE, ErrorCode::TagAttributeNotSupport),
        ];
        for (address, data_type, attribute, expected) in cases {
            assert_eq!(
                ModbusPoint::parse(&tag(address, data_type, attribute)),
                Err(expected),
                "{address}"
            );
        }
    }

    #[test]
    fn bank_round_trips_multi_register_values() {
        let mut bank = RegisterBank::new();
        let float = ModbusPoint::parse(&tag("1!400001", DataType::Float, TagAttribute::READ_WRITE)).unwrap();
        bank.write(&float, DataType::Float, &Value::Float(12.5)).unwrap();
        assert_eq!(bank.read(&float, DataType::Float), Value::Float(12.5));
        assert_eq!(bank.read_words(1, Area::HoldingRegister, 0, 2), vec![0x4148, 0x0000]);

        let signed = ModbusPoint::parse(&tag("1!400003", DataType::Int32, TagAttribute::READ_WRITE)).unwrap();
        bank.write(&signed, DataType::Int32, &Value::Int(-2)).unwrap();
        assert_eq!(bank.read(&signed, DataType::Int32), Value::Int(-2));

        let small = ModbusPoint::parse(&tag("1!400005", DataType::Uint8, TagAttribute::READ_WRITE)).unwrap();
        assert_eq!(
            bank.write(&small, DataType::Uint8, &Value::Int(300)),
            Err(ErrorCode::TagValueInvalid)
        );
    }

    #[tokio::test]
    async fn poll_reads_the_bank_once_connected() {
        let (cb, _bus, metrics) = callbacks("plc1", NodeType::Driver);
        let mut driver = ModbusDriver::new();
        driver.bank_mut().write_words(1, Area::HoldingRegister, 0, &[42]);
        driver.bank_mut().write_words(1, Area::Coil, 4, &[1]);

        let tags = vec![
            Tag::new("level", "1!400001", DataType::Uint16, TagAttribute::READ),
            Tag::new("pump", "1!000005", DataType::Bool, TagAttribute::READ),
        ];
        let values = poll(&mut driver, &cb, &tags);
        assert!(values.iter().all(|v| v.value == Value::Error(ErrorCode::PluginDisconnected)));

        driver
            .apply_setting(&cb, r#"{"host":"127.0.0.1","port":502,"timeout":3000}"#)
            .unwrap();
        driver.start(&cb).unwrap();
        let values = poll(&mut driver, &cb, &tags);
        assert_eq!(values[0].value, Value::Int(42));
        assert_eq!(values[1].value, Value::Bool(true));
        assert_eq!(metrics.value("plc1", SEND_BYTES), Some(2 * REQUEST_FRAME_LEN));
    }

    #[tokio::test]
    async fn writes_only_reach_writable_areas() {
        let (cb, _bus, _metrics) = callbacks("plc2", NodeType::Driver);
        let mut driver = ModbusDriver::new();
        assert!(driver.apply_setting(&cb, r#"{"host":""}"#).is_err());
        driver
            .apply_setting(&cb, r#"{"host":"10.0.0.5","port":502,"timeout":100}"#)
            .unwrap();
        driver.start(&cb).unwrap();

        let holding = Tag::new("sp", "2!400001", DataType::Int16, TagAttribute::READ_WRITE);
        driver.write_tag(&cb, &holding, &Value::Int(-5)).unwrap();
        assert_eq!(driver.bank().read_words(2, Area::HoldingRegister, 0, 1), vec![0xfffb]);

        let input = Tag::new("pv", "2!300001", DataType::Int16, TagAttribute::READ);
        assert_eq!(
            driver.write_tag(&cb, &input, &Value::Int(1)),
            Err(ErrorCode::TagAttributeNotSupport)
        );
        assert_eq!(
            driver.write_tag(&cb, &holding, &Value::Str("x".into())),
            Err(ErrorCode::TagValueInvalid)
        );
    }
}
