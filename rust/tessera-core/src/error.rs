// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

use arrow_schema::ArrowError;
use snafu::{Location, Snafu};

type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Allocates error on the heap and then places `e` into it.
#[inline]
pub fn box_error(e: impl std::error::Error + Send + Sync + 'static) -> BoxedError {
    Box::new(e)
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Invalid user input: {source}, {location}"))]
    InvalidInput {
        source: BoxedError,
        location: Location,
    },
    #[snafu(display("Dataset already exists: {uri}, {location}"))]
    DatasetAlreadyExists { uri: String, location: Location },
    #[snafu(display("Append with different schema: {difference}, location: {location}"))]
    SchemaMismatch {
        difference: String,
        location: Location,
    },
    #[snafu(display("Dataset at path {path} was not found: {source}, {location}"))]
    DatasetNotFound {
        path: String,
        source: BoxedError,
        location: Location,
    },
    #[snafu(display("Encountered corrupt file {path}: {source}, {location}"))]
    CorruptFile {
        path: object_store::path::Path,
        source: BoxedError,
        location: Location,
    },
    #[snafu(display("Not supported: {source}, {location}"))]
    NotSupported {
        source: BoxedError,
        location: Location,
    },
    #[snafu(display("Commit conflict for version {version}: {source}, {location}"))]
    CommitConflict {
        version: u64,
        source: BoxedError,
        location: Location,
    },
    /// The source of record batches failed while it was being consumed.
    #[snafu(display("Upstream data source failed: {source}, {location}"))]
    Upstream {
        source: BoxedError,
        location: Location,
    },
    #[snafu(display("Encountered internal error. {message}, {location}"))]
    Internal { message: String, location: Location },
    #[snafu(display("TesseraError(Arrow): {message}, {location}"))]
    Arrow { message: String, location: Location },
    #[snafu(display("TesseraError(Schema): {message}, {location}"))]
    Schema { message: String, location: Location },
    #[snafu(display("Not found: {uri}, {location}"))]
    NotFound { uri: String, location: Location },
    #[snafu(display("TesseraError(IO): {source}, {location}"))]
    IO {
        source: BoxedError,
        location: Location,
    },
    #[snafu(display("Query Execution error: {message}, {location}"))]
    Execution { message: String, location: Location },
}

impl Error {
    pub fn corrupt_file(
        path: object_store::path::Path,
        message: impl Into<String>,
        location: Location,
    ) -> Self {
        let message: String = message.into();
        Self::CorruptFile {
            path,
            source: message.into(),
            location,
        }
    }

    pub fn invalid_input(message: impl Into<String>, location: Location) -> Self {
        let message: String = message.into();
        Self::InvalidInput {
            source: message.into(),
            location,
        }
    }

    pub fn io(message: impl Into<String>, location: Location) -> Self {
        let message: String = message.into();
        Self::IO {
            source: message.into(),
            location,
        }
    }

    pub fn internal(message: impl Into<String>, location: Location) -> Self {
        Self::Internal {
            message: message.into(),
            location,
        }
    }

    pub fn not_supported(message: impl Into<String>, location: Location) -> Self {
        let message: String = message.into();
        Self::NotSupported {
            source: message.into(),
            location,
        }
    }

    /// Wrap a failure raised by the caller's data source.
    ///
    /// Errors that already are [`Error::Upstream`] are returned unchanged.
    pub fn upstream(source: impl Into<BoxedError>, location: Location) -> Self {
        let source: BoxedError = source.into();
        match source.downcast::<Self>() {
            Ok(err) if matches!(*err, Self::Upstream { .. }) => *err,
            Ok(err) => Self::Upstream {
                source: err,
                location,
            },
            Err(source) => Self::Upstream { source, location },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
/// Where the `?` that converted an error sits, not the `From` impl.
#[track_caller]
fn caller_location() -> Location {
    let caller = std::panic::Location::caller();
    Location::new(caller.file(), caller.line(), caller.column())
}

impl From<ArrowError> for Error {
    #[track_caller]
    fn from(e: ArrowError) -> Self {
        match e {
            ArrowError::ExternalError(err) => match err.downcast::<Self>() {
                Ok(err) => *err,
                Err(err) => Self::IO {
                    source: err,
                    location: caller_location(),
                },
            },
            ArrowError::IoError(_, err) => Self::IO {
                source: box_error(err),
                location: caller_location(),
            },
            ArrowError::SchemaError(message) => Self::Schema {
                message,
                location: caller_location(),
            },
            _ => Self::Arrow {
                message: e.to_string(),
                location: caller_location(),
            },
        }
    }
}

impl From<std::io::Error> for Error {
    #[track_caller]
    fn from(e: std::io::Error) -> Self {
        Self::IO {
            source: box_error(e),
            location: caller_location(),
        }
    }
}

impl From<object_store::Error> for Error {
    #[track_caller]
    fn from(e: object_store::Error) -> Self {
        match e {
            object_store::Error::NotFound { path, .. } => Self::NotFound {
                uri: path,
                location: caller_location(),
            },
            _ => Self::IO {
                source: box_error(e),
                location: caller_location(),
            },
        }
    }
}

impl From<object_store::path::Error> for Error {
    #[track_caller]
    fn from(e: object_store::path::Error) -> Self {
        Self::IO {
            source: box_error(e),
            location: caller_location(),
        }
    }
}

impl From<url::ParseError> for Error {
    #[track_caller]
    fn from(e: url::ParseError) -> Self {
        Self::InvalidInput {
            source: box_error(e),
            location: caller_location(),
        }
    }
}

impl From<serde_json::Error> for Error {
    #[track_caller]
    fn from(e: serde_json::Error) -> Self {
        use serde_json::error::Category;
        match e.classify() {
            Category::Io => Self::IO {
                source: box_error(e),
                location: caller_location(),
            },
            Category::Data | Category::Syntax | Category::Eof => Self::InvalidInput {
                source: box_error(e),
                location: caller_location(),
            },
        }
    }
}

#[cfg(feature = "datafusion")]
impl From<datafusion_sql::sqlparser::parser::ParserError> for Error {
    #[track_caller]
    fn from(e: datafusion_sql::sqlparser::parser::ParserError) -> Self {
        Self::InvalidInput {
            source: box_error(e),
            location: caller_location(),
        }
    }
}

#[cfg(feature = "datafusion")]
impl From<datafusion_sql::sqlparser::tokenizer::TokenizerError> for Error {
    #[track_caller]
    fn from(e: datafusion_sql::sqlparser::tokenizer::TokenizerError) -> Self {
        Self::InvalidInput {
            source: box_error(e),
            location: caller_location(),
        }
    }
}

#[cfg(feature = "datafusion")]
impl From<datafusion_common::DataFusionError> for Error {
    #[track_caller]
    fn from(e: datafusion_common::DataFusionError) -> Self {
        use datafusion_common::DataFusionError::*;
        let e = match e {
            External(err) => match err.downcast::<Self>() {
                Ok(err) => return *err,
                Err(err) => External(err),
            },
            ArrowError(err, ..) => return err.into(),
            IoError(err) => return err.into(),
            SQL(err, ..) => return err.into(),
            Context(_, err) => return (*err).into(),
            _ => e,
        };
        // Planning fails on expressions that do not fit the schema
        if matches!(e, Plan(_) | SchemaError(..) | NotImplemented(_)) {
            Self::InvalidInput {
                source: box_error(e),
                location: caller_location(),
            }
        } else {
            Self::Execution {
                message: e.to_string(),
                location: caller_location(),
            }
        }
    }
}

impl From<Error> for ArrowError {
    fn from(value: Error) -> Self {
        Self::ExternalError(Box::new(value))
    }
}
