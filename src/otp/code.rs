use std::fmt::Display;
use std::str::FromStr;

use rand::distributions::{Distribution, Uniform};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;

pub const CODE_LENGTH: usize = 6;

/// A one-time code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Code {
    #[serde(with = "serialize_code")]
    digits: [u8; CODE_LENGTH],
}

impl Code {
    /// Generate a uniformly random code.
    pub fn random() -> Self {
        let mut digits = [0; CODE_LENGTH];
        let digit_dist = Uniform::from(0..=9);
        let mut rng = rand::thread_rng();
        for digit in &mut digits {
            *digit = digit_dist.sample(&mut rng);
        }
        Self { digits }
    }

    /// Compare against another code without leaking the position of the
    /// first differing digit.
    pub(crate) fn constant_time_eq(&self, other: &Code) -> bool {
        self.digits.ct_eq(&other.digits).into()
    }
}

/// (De)serialisation for one-time codes.
mod serialize_code {
    use serde::{
        de::{Error, Unexpected, Visitor},
        Deserializer, Serializer,
    };

    use super::CODE_LENGTH;

    pub fn serialize<S>(digits: &[u8; CODE_LENGTH], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&digits.iter().map(|n| (n + 48) as char).collect::<String>())
    }

    struct StrVisitor;

    impl<'de> Visitor<'de> for StrVisitor {
        type Value = [u8; CODE_LENGTH];

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(formatter, "a string of {} digits", CODE_LENGTH)
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: Error,
        {
            if v.len() != CODE_LENGTH {
                return Err(E::invalid_length(
                    v.len(),
                    &format!("a string of {} digit characters", CODE_LENGTH).as_str(),
                ));
            }

            v.chars()
                .map(|c| {
                    c.to_digit(10)
                        .map(|digit| digit as u8)
                        .ok_or_else(|| E::invalid_value(Unexpected::Char(c), &"a digit character"))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(|digits| digits.try_into().unwrap()) // Valid because the input length has been checked
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; CODE_LENGTH], D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_str(StrVisitor)
    }
}

impl Display for Code {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            formatter,
            "{}",
            self.digits
                .iter()
                .map(|digit| char::from_digit(*digit as u32, 10).unwrap())
                .collect::<String>()
        )
    }
}

impl FromStr for Code {
    type Err = ParseError;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        let len = string.len();
        if len != CODE_LENGTH {
            return Err(Self::Err::InvalidLength(len));
        }
        let digits = string
            .chars()
            .map(|c| match c {
                '0'..='9' => Ok(c as u8 - 48),
                _ => Err(Self::Err::InvalidChar(c)),
            })
            .collect::<Result<Vec<u8>, Self::Err>>()?;
        Ok(Self {
            digits: digits.try_into().unwrap(), // Valid because digits.len() == CODE_LENGTH
        })
    }
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("code must contain exactly 6 characters")]
    InvalidLength(usize),
    #[error("code must contain only digits")]
    InvalidChar(char),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_display_round_trip() {
        let code: Code = "042137".parse().unwrap();
        assert_eq!(code.to_string(), "042137");
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(
            "12345".parse::<Code>(),
            Err(ParseError::InvalidLength(5))
        ));
        assert!(matches!(
            "12345a".parse::<Code>(),
            Err(ParseError::InvalidChar('a'))
        ));
    }

    #[test]
    fn comparison_distinguishes_codes() {
        let a: Code = "111111".parse().unwrap();
        let b: Code = "111112".parse().unwrap();
        assert!(a.constant_time_eq(&a));
        assert!(!a.constant_time_eq(&b));
    }
}
