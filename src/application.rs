use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of an application that owns a set of experiments.
///
/// Application names are used as path segments against the experiment
/// service and as the persisted default selection, so they are validated
/// once at construction and passed around as a typed key afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ApplicationName(String);

impl ApplicationName {
    /// Creates a new application name.
    ///
    /// Surrounding whitespace is trimmed before validation.
    ///
    /// # Errors
    /// Returns an error if the name is empty or contains control characters
    /// or a path separator.
    pub fn new(name: impl Into<String>) -> Result<Self, ApplicationNameError> {
        let name = name.into();
        let trimmed = name.trim();
        Self::validate(trimmed)?;
        Ok(ApplicationName(trimmed.to_string()))
    }

    fn validate(name: &str) -> Result<(), ApplicationNameError> {
        if name.is_empty() {
            return Err(ApplicationNameError::EmptyName);
        }

        if name.chars().any(|c| c.is_control() || c == '/') {
            return Err(ApplicationNameError::InvalidCharacters);
        }

        Ok(())
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ApplicationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ApplicationName {
    type Error = ApplicationNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ApplicationName::new(value)
    }
}

impl From<ApplicationName> for String {
    fn from(name: ApplicationName) -> Self {
        name.0
    }
}

/// Errors that can occur when creating an application name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplicationNameError {
    /// The name is empty (or only whitespace)
    EmptyName,
    /// The name contains control characters or a path separator
    InvalidCharacters,
}

impl fmt::Display for ApplicationNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplicationNameError::EmptyName => write!(f, "Application name cannot be empty"),
            ApplicationNameError::InvalidCharacters => {
                write!(f, "Application name contains invalid characters")
            }
        }
    }
}

impl std::error::Error for ApplicationNameError {}
