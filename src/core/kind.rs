//! Purpose: Classify delivered payloads and map them to stable ABI codes.
//! Exports: `ResponseKind`, `CUSTOM_BASE`.
//! Invariants: 0/1/2 are end/success/error; custom kinds live at `CUSTOM_BASE` and above.
use super::error::{Error, ErrorKind};

pub const CUSTOM_BASE: u32 = 100;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ResponseKind {
    /// Terminal marker that carries no payload bytes.
    End,
    Success,
    Error,
    /// Intermediate payload; the value is the full code (>= `CUSTOM_BASE`).
    Custom(u32),
}

impl ResponseKind {
    pub fn custom() -> Self {
        Self::Custom(CUSTOM_BASE)
    }

    pub fn code(self) -> u32 {
        match self {
            ResponseKind::End => 0,
            ResponseKind::Success => 1,
            ResponseKind::Error => 2,
            ResponseKind::Custom(code) => code,
        }
    }

    pub fn from_code(code: u32) -> Result<Self, Error> {
        match code {
            0 => Ok(ResponseKind::End),
            1 => Ok(ResponseKind::Success),
            2 => Ok(ResponseKind::Error),
            code if code >= CUSTOM_BASE => Ok(ResponseKind::Custom(code)),
            code => Err(Error::new(ErrorKind::Usage)
                .with_message(format!("reserved response kind code {code}"))),
        }
    }

    pub fn is_custom(self) -> bool {
        matches!(self, ResponseKind::Custom(_))
    }

    pub fn label(self) -> &'static str {
        match self {
            ResponseKind::End => "end",
            ResponseKind::Success => "success",
            ResponseKind::Error => "error",
            ResponseKind::Custom(_) => "custom",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CUSTOM_BASE, ResponseKind};

    #[test]
    fn codes_match_abi_header() {
        assert_eq!(ResponseKind::End.code(), 0);
        assert_eq!(ResponseKind::Success.code(), 1);
        assert_eq!(ResponseKind::Error.code(), 2);
        assert_eq!(ResponseKind::custom().code(), CUSTOM_BASE);
    }

    #[test]
    fn reserved_codes_are_rejected() {
        assert!(ResponseKind::from_code(3).is_err());
        assert!(ResponseKind::from_code(99).is_err());
        assert_eq!(
            ResponseKind::from_code(107).expect("custom"),
            ResponseKind::Custom(107)
        );
    }
}
