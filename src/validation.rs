use alloy::primitives::Address;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    #[error("Invalid address format: {0}")]
    InvalidAddress(String),

    #[error("Invalid block range: {start} > {end}")]
    InvalidBlockRange { start: u64, end: u64 },
}

/// Parses a hex address in any letter case.
///
/// Mixed-case input must carry a valid EIP-55 checksum; all-lower and
/// all-upper input is accepted as is.
pub fn normalize_address(address: &str) -> Result<Address, ValidationError> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::MissingParameter("address".to_string()));
    }

    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let has_lower = digits.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = digits.chars().any(|c| c.is_ascii_uppercase());

    let parsed = if has_lower && has_upper {
        Address::parse_checksummed(trimmed, None).ok()
    } else {
        Address::from_str(trimmed).ok()
    };

    parsed.ok_or_else(|| ValidationError::InvalidAddress(address.to_string()))
}

/// Lower-case hex form used as the lookup key for contracts.
pub fn address_key(address: &Address) -> String {
    format!("{:#x}", address)
}

pub fn validate_block_range(start: u64, end: u64) -> Result<(), ValidationError> {
    if start > end {
        return Err(ValidationError::InvalidBlockRange { start, end });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const USDC_AVAX: &str = "0xB97EF9Ef8734C71904D8002F8b6Bc66Dd9c48a6E";

    #[test]
    fn test_normalize_accepts_any_consistent_case() {
        let checksummed = normalize_address(USDC_AVAX).unwrap();
        let lower = normalize_address(&USDC_AVAX.to_lowercase()).unwrap();
        assert_eq!(checksummed, lower);
        assert_eq!(checksummed.to_checksum(None), USDC_AVAX);
        assert_eq!(address_key(&checksummed), USDC_AVAX.to_lowercase());
    }

    #[test]
    fn test_normalize_rejects_malformed() {
        assert!(matches!(
            normalize_address("0x1234"),
            Err(ValidationError::InvalidAddress(_))
        ));
        assert!(matches!(
            normalize_address("   "),
            Err(ValidationError::MissingParameter(_))
        ));
        // Flip one letter's case so the checksum no longer matches.
        let broken = USDC_AVAX.replacen('B', "b", 1).replacen("e6E", "e6e", 1);
        assert!(normalize_address(&broken).is_err());
    }

    #[test]
    fn test_block_range() {
        assert!(validate_block_range(100, 200).is_ok());
        assert!(validate_block_range(200, 200).is_ok());
        assert_eq!(
            validate_block_range(201, 200),
            Err(ValidationError::InvalidBlockRange { start: 201, end: 200 })
        );
    }
}
