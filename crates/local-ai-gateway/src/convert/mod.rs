//! Declarative conversion framework: named steps compiled into pipelines,
//! one pipeline per (service, direction).

pub mod pipeline;
pub mod pointer;
pub mod steps;

pub use pipeline::ConverterPipeline;
pub use steps::{ConversionStep, StepDef};

use std::fmt;

/// Which payload a cross-dialect conversion applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversionKind {
    Request,
    Response,
    StreamResponse,
}

impl ConversionKind {
    pub fn to_canonical(self) -> Conversion {
        match self {
            ConversionKind::Request => Conversion::RequestToCanonical,
            ConversionKind::Response => Conversion::ResponseToCanonical,
            ConversionKind::StreamResponse => Conversion::StreamResponseToCanonical,
        }
    }

    pub fn from_canonical(self) -> Conversion {
        match self {
            ConversionKind::Request => Conversion::RequestFromCanonical,
            ConversionKind::Response => Conversion::ResponseFromCanonical,
            ConversionKind::StreamResponse => Conversion::StreamResponseFromCanonical,
        }
    }
}

/// The six conversion directions a dialect defines per service. Being a closed
/// enum, an unknown direction cannot reach a pipeline lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Conversion {
    RequestToCanonical,
    RequestFromCanonical,
    ResponseToCanonical,
    ResponseFromCanonical,
    StreamResponseToCanonical,
    StreamResponseFromCanonical,
}

impl Conversion {
    pub const ALL: [Conversion; 6] = [
        Conversion::RequestToCanonical,
        Conversion::RequestFromCanonical,
        Conversion::ResponseToCanonical,
        Conversion::ResponseFromCanonical,
        Conversion::StreamResponseToCanonical,
        Conversion::StreamResponseFromCanonical,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Conversion::RequestToCanonical => "request_to_canonical",
            Conversion::RequestFromCanonical => "request_from_canonical",
            Conversion::ResponseToCanonical => "response_to_canonical",
            Conversion::ResponseFromCanonical => "response_from_canonical",
            Conversion::StreamResponseToCanonical => "stream_response_to_canonical",
            Conversion::StreamResponseFromCanonical => "stream_response_from_canonical",
        }
    }
}

impl fmt::Display for Conversion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
