//! Status codes carried by HELLO and STATUS payloads.

/// One-byte reply status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    Unauthorized = 1,
    Forbidden = 2,
    NotFound = 3,
    Conflict = 4,
    BadRequest = 5,
    TooLarge = 6,
    RateLimited = 7,
    InternalError = 8,
}

impl Status {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Status::Ok,
            1 => Status::Unauthorized,
            2 => Status::Forbidden,
            3 => Status::NotFound,
            4 => Status::Conflict,
            5 => Status::BadRequest,
            6 => Status::TooLarge,
            7 => Status::RateLimited,
            8 => Status::InternalError,
            _ => return None,
        })
    }
}

impl From<Status> for u8 {
    fn from(s: Status) -> Self {
        s as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in 0u8..=8 {
            let status = Status::from_u8(code).unwrap();
            assert_eq!(u8::from(status), code);
        }
        assert!(Status::from_u8(9).is_none());
        assert!(Status::from_u8(255).is_none());
    }
}
