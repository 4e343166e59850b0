//! XML parameter file codec
//!
//! The human-editable parameter format: one `<esc_parameters>` root with one
//! empty element per block kind, fields as attributes. Decodes to the same
//! byte blocks as the binary form, so the two encodings are interchangeable.
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <esc_parameters>
//!   <board hardware_rev="31" num_cells="4" shutdown_voltage="12.2"
//!          overtemp_limit="110" current_limit="40"/>
//!   <id id="0" reversed="0" broadcast_telemetry="1" motor_poles="14"/>
//!   <uart baud_rate="250000" proto_version="1" char_timeout_ms="50"/>
//!   <tune kp="0.05" ki="0.01" max_kerr_sum="100" min_rpm="1000"
//!         max_rpm="27000" rpm_filter_alpha="0.6"/>
//! </esc_parameters>
//! ```

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use std::str::FromStr;

use super::{BoardConfig, IdConfig, ParamError, ParameterSet, TuneConfig, UartConfig};

/// Errors that can occur while reading or writing XML parameter files.
#[derive(Debug, thiserror::Error)]
pub enum XmlParamError {
    /// XML syntax error.
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    /// I/O error while writing.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A required element is missing from the document.
    #[error("missing element: {0}")]
    MissingElement(&'static str),

    /// A required attribute is missing from an element.
    #[error("element '{element}' is missing attribute '{attribute}'")]
    MissingAttribute {
        /// Element name.
        element: &'static str,
        /// Attribute name.
        attribute: &'static str,
    },

    /// An attribute value failed to parse as its field type.
    #[error("invalid value '{value}' for attribute '{attribute}'")]
    InvalidValue {
        /// Attribute name.
        attribute: &'static str,
        /// Offending text.
        value: String,
    },

    /// Block-level error while assembling the set.
    #[error(transparent)]
    Param(#[from] ParamError),
}

/// Parse an XML parameter document into a [`ParameterSet`].
///
/// Structural only: values are range-checked later by
/// [`ParameterSet::is_valid`], the same way a device response is.
pub fn params_from_xml(xml: &str) -> Result<ParameterSet, XmlParamError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut board = None;
    let mut id = None;
    let mut uart = None;
    let mut tune = None;

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => match e.name().as_ref() {
                b"board" => board = Some(parse_board(e)?),
                b"id" => id = Some(parse_id(e)?),
                b"uart" => uart = Some(parse_uart(e)?),
                b"tune" => tune = Some(parse_tune(e)?),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }
        buf.clear();
    }

    let board = board.ok_or(XmlParamError::MissingElement("board"))?;
    let id = id.ok_or(XmlParamError::MissingElement("id"))?;
    let uart = uart.ok_or(XmlParamError::MissingElement("uart"))?;
    let tune = tune.ok_or(XmlParamError::MissingElement("tune"))?;

    Ok(ParameterSet::from_configs(&board, &id, &uart, &tune))
}

/// Encode a complete [`ParameterSet`] as an XML document.
pub fn params_to_xml(set: &ParameterSet) -> Result<String, XmlParamError> {
    let board = set.board()?;
    let id = set.id()?;
    let uart = set.uart()?;
    let tune = set.tune()?;

    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::Start(BytesStart::new("esc_parameters")))?;

    let mut e = BytesStart::new("board");
    e.push_attribute(("hardware_rev", board.hardware_rev.to_string().as_str()));
    e.push_attribute(("num_cells", board.num_cells.to_string().as_str()));
    e.push_attribute(("shutdown_voltage", board.shutdown_voltage.to_string().as_str()));
    e.push_attribute(("overtemp_limit", board.overtemp_limit.to_string().as_str()));
    e.push_attribute(("current_limit", board.current_limit.to_string().as_str()));
    writer.write_event(Event::Empty(e))?;

    let mut e = BytesStart::new("id");
    e.push_attribute(("id", id.id.to_string().as_str()));
    e.push_attribute(("reversed", (id.reversed as u8).to_string().as_str()));
    e.push_attribute((
        "broadcast_telemetry",
        (id.broadcast_telemetry as u8).to_string().as_str(),
    ));
    e.push_attribute(("motor_poles", id.motor_poles.to_string().as_str()));
    writer.write_event(Event::Empty(e))?;

    let mut e = BytesStart::new("uart");
    e.push_attribute(("baud_rate", uart.baud_rate.to_string().as_str()));
    e.push_attribute(("proto_version", uart.proto_version.to_string().as_str()));
    e.push_attribute(("char_timeout_ms", uart.char_timeout_ms.to_string().as_str()));
    writer.write_event(Event::Empty(e))?;

    let mut e = BytesStart::new("tune");
    e.push_attribute(("kp", tune.kp.to_string().as_str()));
    e.push_attribute(("ki", tune.ki.to_string().as_str()));
    e.push_attribute(("max_kerr_sum", tune.max_kerr_sum.to_string().as_str()));
    e.push_attribute(("min_rpm", tune.min_rpm.to_string().as_str()));
    e.push_attribute(("max_rpm", tune.max_rpm.to_string().as_str()));
    e.push_attribute(("rpm_filter_alpha", tune.rpm_filter_alpha.to_string().as_str()));
    writer.write_event(Event::Empty(e))?;

    writer.write_event(Event::End(BytesEnd::new("esc_parameters")))?;

    Ok(String::from_utf8_lossy(&writer.into_inner()).to_string())
}

fn get_attribute(e: &BytesStart, name: &str) -> Option<String> {
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == name.as_bytes() {
            return Some(String::from_utf8_lossy(&attr.value).to_string());
        }
    }
    None
}

fn required<T: FromStr>(
    e: &BytesStart,
    element: &'static str,
    attribute: &'static str,
) -> Result<T, XmlParamError> {
    let raw = get_attribute(e, attribute)
        .ok_or(XmlParamError::MissingAttribute { element, attribute })?;
    raw.trim()
        .parse()
        .map_err(|_| XmlParamError::InvalidValue {
            attribute,
            value: raw,
        })
}

fn parse_board(e: &BytesStart) -> Result<BoardConfig, XmlParamError> {
    Ok(BoardConfig {
        hardware_rev: required(e, "board", "hardware_rev")?,
        num_cells: required(e, "board", "num_cells")?,
        shutdown_voltage: required(e, "board", "shutdown_voltage")?,
        overtemp_limit: required(e, "board", "overtemp_limit")?,
        current_limit: required(e, "board", "current_limit")?,
    })
}

fn parse_id(e: &BytesStart) -> Result<IdConfig, XmlParamError> {
    let reversed: u8 = required(e, "id", "reversed")?;
    let broadcast: u8 = required(e, "id", "broadcast_telemetry")?;
    Ok(IdConfig {
        id: required(e, "id", "id")?,
        reversed: reversed != 0,
        broadcast_telemetry: broadcast != 0,
        motor_poles: required(e, "id", "motor_poles")?,
    })
}

fn parse_uart(e: &BytesStart) -> Result<UartConfig, XmlParamError> {
    Ok(UartConfig {
        baud_rate: required(e, "uart", "baud_rate")?,
        proto_version: required(e, "uart", "proto_version")?,
        char_timeout_ms: required(e, "uart", "char_timeout_ms")?,
    })
}

fn parse_tune(e: &BytesStart) -> Result<TuneConfig, XmlParamError> {
    Ok(TuneConfig {
        kp: required(e, "tune", "kp")?,
        ki: required(e, "tune", "ki")?,
        max_kerr_sum: required(e, "tune", "max_kerr_sum")?,
        min_rpm: required(e, "tune", "min_rpm")?,
        max_rpm: required(e, "tune", "max_rpm")?,
        rpm_filter_alpha: required(e, "tune", "rpm_filter_alpha")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::tests::sample_set;
    use pretty_assertions::assert_eq;

    #[test]
    fn xml_roundtrip_preserves_blocks() {
        let set = sample_set();
        let xml = params_to_xml(&set).unwrap();
        let back = params_from_xml(&xml).unwrap();
        assert!(back.matches(&set));
    }

    #[test]
    fn hand_written_document_parses() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<esc_parameters>
  <board hardware_rev="30" num_cells="6" shutdown_voltage="18.0" overtemp_limit="95" current_limit="60"/>
  <id id="2" reversed="1" broadcast_telemetry="0" motor_poles="12"/>
  <uart baud_rate="921600" proto_version="2" char_timeout_ms="20"/>
  <tune kp="0.1" ki="0.02" max_kerr_sum="50" min_rpm="500" max_rpm="25000" rpm_filter_alpha="0.4"/>
</esc_parameters>"#;
        let set = params_from_xml(xml).unwrap();
        assert!(set.is_valid());
        let id = set.id().unwrap();
        assert_eq!(id.id, 2);
        assert!(id.reversed);
        assert_eq!(set.uart().unwrap().baud_rate, 921_600);
    }

    #[test]
    fn missing_element_is_reported() {
        let xml = r#"<esc_parameters>
  <board hardware_rev="30" num_cells="6" shutdown_voltage="18.0" overtemp_limit="95" current_limit="60"/>
</esc_parameters>"#;
        assert!(matches!(
            params_from_xml(xml),
            Err(XmlParamError::MissingElement("id"))
        ));
    }

    #[test]
    fn bad_attribute_value_is_reported() {
        let xml = r#"<esc_parameters>
  <board hardware_rev="thirty" num_cells="6" shutdown_voltage="18.0" overtemp_limit="95" current_limit="60"/>
  <id id="2" reversed="1" broadcast_telemetry="0" motor_poles="12"/>
  <uart baud_rate="921600" proto_version="2" char_timeout_ms="20"/>
  <tune kp="0.1" ki="0.02" max_kerr_sum="50" min_rpm="500" max_rpm="25000" rpm_filter_alpha="0.4"/>
</esc_parameters>"#;
        assert!(matches!(
            params_from_xml(xml),
            Err(XmlParamError::InvalidValue { attribute: "hardware_rev", .. })
        ));
    }

    #[test]
    fn incomplete_set_refuses_to_encode() {
        let set = ParameterSet::default();
        assert!(params_to_xml(&set).is_err());
    }
}
