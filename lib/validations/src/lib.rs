//! # Input Validation Module
//!
//! This module provides validation functions for the task document
//! inputs to prevent invalid data from entering the system.

use std::sync::OnceLock;

use anyhow::anyhow;
use regex::Regex;

/// Options to validate input strings to have certain properties.
/// This ensures only valid data can enter the system.
///
/// ## Usage
///
/// ```
/// validations::StringValidator::default()
///   .min_length(1)
///   .matches(validations::StringValidatorMatches::StepId)
///   .validate("build-api")?
/// # ::anyhow::Ok(())
/// ```
#[derive(Default)]
pub struct StringValidator {
  /// Specify the minimum length of string.
  /// Setting `0` will effectively skip this validation.
  pub min_length: usize,
  /// Specify max length of string, or None to allow arbitrary length.
  pub max_length: Option<usize>,
  /// Skip the control character check.
  /// Most values should not contain these by default.
  pub skip_control_check: bool,
  /// Specify a pattern to validate the string contents.
  pub matches: Option<StringValidatorMatches>,
}

impl StringValidator {
  /// Returns Ok if input passes validations, otherwise includes
  /// error with failure reason.
  pub fn validate(&self, input: &str) -> anyhow::Result<()> {
    let len = input.chars().count();

    if len < self.min_length {
      return Err(anyhow!(
        "Input too short. Must be at least {} characters.",
        self.min_length
      ));
    }

    if let Some(max_length) = self.max_length
      && len > max_length
    {
      return Err(anyhow!(
        "Input too long. Must be at most {max_length} characters."
      ));
    }

    if !self.skip_control_check {
      validate_no_control_chars(input)?;
    }

    if let Some(matches) = &self.matches {
      matches.validate(input)?
    }

    Ok(())
  }

  pub fn min_length(mut self, min_length: usize) -> StringValidator {
    self.min_length = min_length;
    self
  }

  pub fn max_length(
    mut self,
    max_length: impl Into<Option<usize>>,
  ) -> StringValidator {
    self.max_length = max_length.into();
    self
  }

  pub fn skip_control_check(mut self) -> StringValidator {
    self.skip_control_check = true;
    self
  }

  pub fn matches(
    mut self,
    matches: impl Into<Option<StringValidatorMatches>>,
  ) -> StringValidator {
    self.matches = matches.into();
    self
  }
}

pub enum StringValidatorMatches {
  /// - letters, digits, underscores, hyphens
  /// - non-empty, matched against Step `ID` uniqueness rules by the caller
  StepId,
  /// - letters and digits only, used for alias names (`$name`)
  AliasName,
  /// - http or https URL, used for alias `src` entries
  HttpUrl,
}

impl StringValidatorMatches {
  /// Returns Ok if input passes validations, otherwise includes
  /// error with failure reason.
  fn validate(&self, input: &str) -> anyhow::Result<()> {
    let validate = || match self {
      StringValidatorMatches::StepId => {
        static STEP_ID_REGEX: OnceLock<Regex> = OnceLock::new();
        let regex = STEP_ID_REGEX.get_or_init(|| {
          Regex::new(r"^[a-zA-Z0-9_.-]+$")
            .expect("Failed to initialize step id regex")
        });
        if regex.is_match(input) {
          Ok(())
        } else {
          Err(anyhow!(
            "Only alphanumeric characters, underscores, hyphens, and dots are allowed"
          ))
        }
      }

      StringValidatorMatches::AliasName => {
        static ALIAS_NAME_REGEX: OnceLock<Regex> = OnceLock::new();
        let regex = ALIAS_NAME_REGEX.get_or_init(|| {
          Regex::new(r"^[a-zA-Z0-9]+$")
            .expect("Failed to initialize alias name regex")
        });
        if regex.is_match(input) {
          Ok(())
        } else {
          Err(anyhow!("Only letters and digits are allowed"))
        }
      }

      StringValidatorMatches::HttpUrl => {
        if !input.starts_with("http://")
          && !input.starts_with("https://")
        {
          return Err(anyhow!(
            "Input must start with http:// or https://"
          ));
        }
        url::Url::parse(input)
          .map(|_| ())
          .map_err(|e| anyhow!("Failed to parse input as URL: {e}"))
      }
    };
    validate().map_err(|e| anyhow!("Invalid characters in input: {e}"))
  }
}

fn validate_no_control_chars(input: &str) -> anyhow::Result<()> {
  for (index, char) in input.chars().enumerate() {
    if char.is_control() {
      return Err(anyhow!(
        "Control character at index {index}. Input: \"{input}\""
      ));
    }
  }
  Ok(())
}

/// The alias directive must be exactly one Unicode scalar value.
pub fn validate_directive(directive: &str) -> anyhow::Result<char> {
  let mut chars = directive.chars();
  match (chars.next(), chars.next()) {
    (Some(c), None) => Ok(c),
    _ => Err(anyhow!(
      "Alias directive must be exactly one character, got \"{directive}\" ({} chars)",
      directive.chars().count()
    )),
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn step_id_accepts_alnum_dash_underscore() {
    StringValidator::default()
      .min_length(1)
      .matches(StringValidatorMatches::StepId)
      .validate("build-api_v2")
      .unwrap();
  }

  #[test]
  fn step_id_accepts_dotted_namespace() {
    StringValidator::default()
      .min_length(1)
      .matches(StringValidatorMatches::StepId)
      .validate("build.api")
      .unwrap();
  }

  #[test]
  fn step_id_rejects_empty() {
    assert!(
      StringValidator::default()
        .min_length(1)
        .matches(StringValidatorMatches::StepId)
        .validate("")
        .is_err()
    );
  }

  #[test]
  fn step_id_rejects_whitespace() {
    assert!(
      StringValidator::default()
        .matches(StringValidatorMatches::StepId)
        .validate("has space")
        .is_err()
    );
  }

  #[test]
  fn directive_requires_single_char() {
    assert_eq!(validate_directive("$").unwrap(), '$');
    assert_eq!(validate_directive("🐳").unwrap(), '🐳');
    assert!(validate_directive("$$").is_err());
    assert!(validate_directive("").is_err());
  }
}
