//! Utility functions for identifier encoding

use bech32::Bech32m;

/// Encodes raw id bytes under the given human readable prefix.
pub fn bytes_to_bech32(hrp: &str, bytes: &[u8]) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    Ok(bech32::encode::<Bech32m>(hrp, bytes)?)
}

/// Decodes a bech32 string, checking that it carries the expected prefix.
pub fn bech32_to_bytes(expected_hrp: &str, encoded: &str) -> anyhow::Result<Vec<u8>> {
    let (hrp, data) = bech32::decode(encoded)?;
    if hrp.as_str() != expected_hrp {
        anyhow::bail!("expected prefix '{expected_hrp}', found '{}'", hrp.as_str());
    }
    Ok(data)
}
