use std::fmt;

use serde::Serialize;

use crate::core::error::{Error, Result};
use crate::core::utils::{format_hex, format_hex_spaced, leading_hex_bytes};

/// Largest payload length and Le value a command can carry
pub const MAX_FIELD_LENGTH: usize = 65_535;

/// Lengths from this value up use the 3-byte extended form
const EXTENDED_LENGTH_THRESHOLD: usize = 255;

/// Encode a length field for Lc or Le.
///
/// Lengths below 255 are a single byte. Anything from 255 up is written as
/// `00 hi lo`. The cutoff is 255, not 256: a length of exactly 255 already
/// takes the extended form.
pub fn encode_length(length: u16) -> Vec<u8> {
    if (length as usize) < EXTENDED_LENGTH_THRESHOLD {
        vec![length as u8]
    } else {
        let [hi, lo] = length.to_be_bytes();
        vec![0x00, hi, lo]
    }
}

fn checked_length(length: usize, what: &str) -> Result<u16> {
    if length == 0 || length > MAX_FIELD_LENGTH {
        return Err(Error::InvalidArgument(format!(
            "{what} is between 1..{MAX_FIELD_LENGTH}, got {length}"
        )));
    }
    Ok(length as u16)
}

/// A fully assembled command message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CommandApdu {
    #[serde(serialize_with = "serialize_hex")]
    bytes: Vec<u8>,
}

fn serialize_hex<S: serde::Serializer>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_hex(bytes))
}

impl CommandApdu {
    /// Wrap bytes that were assembled elsewhere
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// CLA, INS, P1 and P2, when the message is long enough to carry them
    pub fn header(&self) -> Option<[u8; 4]> {
        self.bytes.get(..4).and_then(|h| h.try_into().ok())
    }
}

impl AsRef<[u8]> for CommandApdu {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl From<CommandApdu> for Vec<u8> {
    fn from(apdu: CommandApdu) -> Self {
        apdu.bytes
    }
}

impl fmt::Display for CommandApdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_hex_spaced(&self.bytes))
    }
}

/// Builder for [`CommandApdu`].
///
/// Every setter consumes the builder and hands back the updated value, so a
/// failed setter never leaves a half-updated builder behind. Clone the
/// builder first if the unmodified one is needed after a failure.
///
/// ```
/// use pcsc_autoreader::core::apdu::ApduBuilder;
///
/// let apdu = ApduBuilder::new()
///     .ins(0xA4)
///     .p1(0x04)
///     .data(&[0x01, 0x02, 0x03])
///     .unwrap()
///     .build();
/// assert_eq!(apdu.as_bytes(), &[0x00, 0xA4, 0x04, 0x00, 0x03, 0x01, 0x02, 0x03]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApduBuilder {
    header: [u8; 4],
    lc: Option<Vec<u8>>,
    data: Option<Vec<u8>>,
    le: Option<Vec<u8>>,
}

impl ApduBuilder {
    /// Create a builder with an all-zero header and no body
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cla(mut self, cla: u8) -> Self {
        self.header[0] = cla;
        self
    }

    pub fn ins(mut self, ins: u8) -> Self {
        self.header[1] = ins;
        self
    }

    pub fn p1(mut self, p1: u8) -> Self {
        self.header[2] = p1;
        self
    }

    pub fn p2(mut self, p2: u8) -> Self {
        self.header[3] = p2;
        self
    }

    /// Set all four header bytes at once: CLA, INS, P1, P2
    pub fn header(mut self, header: [u8; 4]) -> Self {
        self.header = header;
        self
    }

    /// Set the payload. Its length must be within 1..=65535.
    pub fn data(mut self, data: &[u8]) -> Result<Self> {
        let length = checked_length(data.len(), "Data length")?;
        self.lc = Some(encode_length(length));
        self.data = Some(data.to_vec());
        Ok(self)
    }

    /// Set the payload from the hex digits at the start of `hex`.
    ///
    /// Only the leading run of hex digits counts; an odd run is padded with a
    /// low `0` nibble. When `hex` does not start with a hex digit the payload
    /// is cleared instead. This never fails for short input, but a run longer
    /// than 65535 bytes is rejected like [`ApduBuilder::data`].
    pub fn data_hex(self, hex: &str) -> Result<Self> {
        match leading_hex_bytes(hex) {
            Some(bytes) => self.data(&bytes),
            None => Ok(self.clear_data()),
        }
    }

    /// Remove the payload and its length field
    pub fn clear_data(mut self) -> Self {
        self.lc = None;
        self.data = None;
        self
    }

    /// Set the expected response length. It must be within 1..=65535.
    pub fn le(mut self, le: usize) -> Result<Self> {
        let length = checked_length(le, "Le")?;
        self.le = Some(encode_length(length));
        Ok(self)
    }

    pub fn clear_le(mut self) -> Self {
        self.le = None;
        self
    }

    pub fn header_bytes(&self) -> [u8; 4] {
        self.header
    }

    /// The encoded Lc field, if a payload is set
    pub fn lc_field(&self) -> Option<&[u8]> {
        self.lc.as_deref()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// The encoded Le field, if one is set
    pub fn le_field(&self) -> Option<&[u8]> {
        self.le.as_deref()
    }

    /// Assemble the command: header, then Lc and data, then Le
    pub fn build(&self) -> CommandApdu {
        let body_len = self.lc.as_ref().map_or(0, Vec::len)
            + self.data.as_ref().map_or(0, Vec::len)
            + self.le.as_ref().map_or(0, Vec::len);

        let mut bytes = Vec::with_capacity(4 + body_len);
        bytes.extend_from_slice(&self.header);
        if let (Some(lc), Some(data)) = (&self.lc, &self.data) {
            bytes.extend_from_slice(lc);
            bytes.extend_from_slice(data);
        }
        if let Some(le) = &self.le {
            bytes.extend_from_slice(le);
        }

        CommandApdu { bytes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select() -> ApduBuilder {
        ApduBuilder::new().cla(0x00).ins(0xA4).p1(0x04).p2(0x00)
    }

    #[test]
    fn test_encode_length_short_form() {
        assert_eq!(encode_length(1), vec![0x01]);
        assert_eq!(encode_length(0x80), vec![0x80]);
        assert_eq!(encode_length(254), vec![0xFE]);
    }

    #[test]
    fn test_encode_length_extended_form_starts_at_255() {
        assert_eq!(encode_length(255), vec![0x00, 0x00, 0xFF]);
        assert_eq!(encode_length(256), vec![0x00, 0x01, 0x00]);
        assert_eq!(encode_length(300), vec![0x00, 0x01, 0x2C]);
        assert_eq!(encode_length(65535), vec![0x00, 0xFF, 0xFF]);
    }

    #[test]
    fn test_build_header_only() {
        assert_eq!(select().build().as_bytes(), &[0x00, 0xA4, 0x04, 0x00]);
        assert_eq!(ApduBuilder::new().build().as_bytes(), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_build_with_data() {
        let apdu = select().data(&[0x01, 0x02, 0x03]).unwrap().build();
        assert_eq!(
            apdu.as_bytes(),
            &[0x00, 0xA4, 0x04, 0x00, 0x03, 0x01, 0x02, 0x03]
        );
    }

    #[test]
    fn test_build_with_data_and_le() {
        let apdu = select().data(&[0xAA]).unwrap().le(256).unwrap().build();
        assert_eq!(
            apdu.as_bytes(),
            &[0x00, 0xA4, 0x04, 0x00, 0x01, 0xAA, 0x00, 0x01, 0x00]
        );
    }

    #[test]
    fn test_build_with_le_only() {
        let apdu = ApduBuilder::new().ins(0xB0).le(16).unwrap().build();
        assert_eq!(apdu.as_bytes(), &[0x00, 0xB0, 0x00, 0x00, 0x10]);
    }

    #[test]
    fn test_data_length_bounds() {
        assert!(matches!(
            ApduBuilder::new().data(&[]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(ApduBuilder::new().data(&vec![0; MAX_FIELD_LENGTH]).is_ok());
        assert!(matches!(
            ApduBuilder::new().data(&vec![0; MAX_FIELD_LENGTH + 1]),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_le_bounds() {
        assert!(ApduBuilder::new().le(0).is_err());
        assert!(ApduBuilder::new().le(1).is_ok());
        assert!(ApduBuilder::new().le(65535).is_ok());
        assert!(ApduBuilder::new().le(65536).is_err());
    }

    #[test]
    fn test_failed_setter_leaves_clone_untouched() {
        let builder = select().data(&[0x01]).unwrap();
        assert!(builder.clone().data(&[]).is_err());
        assert_eq!(builder.payload(), Some(&[0x01][..]));
        assert_eq!(builder.lc_field(), Some(&[0x01][..]));
    }

    #[test]
    fn test_data_hex_sets_payload() {
        let builder = ApduBuilder::new().data_hex("1A2B").unwrap();
        assert_eq!(builder.payload(), Some(&[0x1A, 0x2B][..]));
        assert_eq!(builder.lc_field(), Some(&[0x02][..]));

        let builder = ApduBuilder::new().data_hex("A2B").unwrap();
        assert_eq!(builder.payload(), Some(&[0xA2, 0xB0][..]));
        assert_eq!(builder.lc_field(), Some(&[0x02][..]));
    }

    #[test]
    fn test_data_hex_without_leading_digits_clears_payload() {
        let builder = ApduBuilder::new()
            .data(&[0x01])
            .unwrap()
            .data_hex("xyz123")
            .unwrap();
        assert_eq!(builder.payload(), None);
        assert_eq!(builder.lc_field(), None);
        assert_eq!(builder.build().len(), 4);
    }

    #[test]
    fn test_clear_is_idempotent() {
        let once = select().data(&[0x01]).unwrap().le(2).unwrap().clear_data();
        let twice = once.clone().clear_data();
        assert_eq!(once, twice);

        let once = once.clear_le();
        assert_eq!(once.clone().clear_le(), once);
        assert_eq!(once.build(), select().build());
    }

    #[test]
    fn test_build_is_repeatable() {
        let builder = select().data(&[0x01, 0x02]).unwrap().le(0x10).unwrap();
        assert_eq!(builder.build(), builder.build());

        let rebuilt = builder.clone().p2(0x0C).build();
        assert_ne!(rebuilt, builder.build());
        assert_eq!(rebuilt.header(), Some([0x00, 0xA4, 0x04, 0x0C]));
    }

    #[test]
    fn test_command_apdu_display() {
        let apdu = select().build();
        assert_eq!(apdu.to_string(), "00 A4 04 00");
        assert_eq!(CommandApdu::from_bytes(vec![0x00]).header(), None);
    }

    #[test]
    fn test_command_apdu_serialization() {
        let json = serde_json::to_string(&select().build()).unwrap();
        assert_eq!(json, r#"{"bytes":"00A40400"}"#);
    }
}
