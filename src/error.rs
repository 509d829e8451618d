//! An error from the berth placement engine

/// An error from the berth placement engine
///
/// Recoverable placement failures never surface here; they flow through
/// [`crate::models::TaskAssignmentResult`] records instead. This type covers
/// programmer errors, invariant breaches, and failures in the ambient stack.
#[derive(Debug)]
pub enum Error {
    /// A generic error with a message
    Generic(String),
    /// A lease with this id was already added to a machine
    DuplicateLease(String),
    /// A port was requested from a fully consumed port pool
    PortsExhausted(u32),
    /// An error from loading a config
    Config(config::ConfigError),
    /// An error from converting a value with serde
    Serde(serde_json::Error),
    /// An error from converting a value with serde to YAML
    SerdeYaml(serde_yaml::Error),
}

impl Error {
    /// Create a new generic error
    ///
    /// # Arguments
    ///
    /// * `msg` - The error message to set
    pub fn new<T: Into<String>>(msg: T) -> Self {
        Error::Generic(msg.into())
    }

    /// Get the error message for this error if one exists
    pub fn msg(&self) -> Option<String> {
        // get the msg from any error types that support it
        match self {
            Error::Generic(msg) => Some(msg.clone()),
            Error::DuplicateLease(id) => {
                Some(format!("Attempt to add duplicate lease with id {}", id))
            }
            Error::PortsExhausted(total) => Some(format!("All ports ({}) already used up", total)),
            Error::Config(err) => Some(err.to_string()),
            Error::Serde(err) => Some(err.to_string()),
            Error::SerdeYaml(err) => Some(err.to_string()),
        }
    }

    /// Get the kind of error as a str
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Generic(_) => "Generic",
            Error::DuplicateLease(_) => "DuplicateLease",
            Error::PortsExhausted(_) => "PortsExhausted",
            Error::Config(_) => "Config",
            Error::Serde(_) => "Serde",
            Error::SerdeYaml(_) => "SerdeYaml",
        }
    }
}

impl std::fmt::Display for Error {
    /// Display this error in an easily readable format
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.msg() {
            Some(msg) => write!(f, "Error: {}", msg),
            None => write!(f, "Kind: {}", self.kind()),
        }
    }
}

// mark that this is an error struct
impl std::error::Error for Error {}

impl From<config::ConfigError> for Error {
    fn from(error: config::ConfigError) -> Self {
        Error::Config(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serde(error)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(error: serde_yaml::Error) -> Self {
        Error::SerdeYaml(error)
    }
}
