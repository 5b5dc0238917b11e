use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
	#[error("io error on {}: {source}", path.display())]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
}

impl Error {
	pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
		Error::Io { path: path.into(), source }
	}
}

pub type Result<T> = std::result::Result<T, Error>;
