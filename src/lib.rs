use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("Yaml Error: {0}")]
    YamlError(#[source] serde_yaml::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("IO Error: {0}")]
    IoError(std::io::Error),

    #[error("Patch Error: {0}")]
    PatchError(#[source] json_patch::PatchError),

    #[error("Missing Label: {0}")]
    MissingLabel(String),

    #[error("Missing Annotation: {0}")]
    MissingAnnotation(String),

    #[error("Invalid Config: {0}")]
    InvalidConfig(String),

    #[error("Unknown Kind: {0}")]
    UnknownKind(String),

    #[error("no install strategy configmap found for version {version} with registry {registry}")]
    StrategyNotFound { version: String, registry: String },

    /// NB: this is a catch-all for any other errors
    #[error("Other Error: {0}")]
    OtherError(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::KubeError(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::YamlError(e)
    }
}

impl Error {
    fn api_reason(&self) -> Option<(&str, u16)> {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => Some((resp.reason.as_str(), resp.code)),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.api_reason(), Some((_, 404)) | Some(("NotFound", _)))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self.api_reason(), Some(("AlreadyExists", _)))
    }
}

#[macro_use]
mod macros;

pub mod apply;
pub mod client;
pub mod components;
pub mod conditions;
pub mod config;
pub mod controller;
pub mod crd;
pub mod events_helper;
pub mod expectations;
pub mod helper;
pub mod install;
pub mod kinds;
pub mod stores;
pub mod workqueue;

/// Log and trace integrations
pub mod telemetry;
