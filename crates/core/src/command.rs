//! One-shot command wrapper.

use std::sync::Arc;

use p4_protocol::{InfoMessage, TaggedRecord};

use crate::error::Result;
use crate::registry::CommandId;
use crate::results::{ErrorRecord, ResultBundle};
use crate::session::Session;

/// A command bound to a session, run once with [`Command::run`].
///
/// Takes a fresh id from the session unless one is given, and releases the
/// registry entry when dropped.
///
/// ```ignore
/// let result = Command::new(&session, "dirs", ["//depot/*"]).tagged(false).run()?;
/// for info in result.info() {
///     println!("{}", info.text);
/// }
/// ```
#[derive(Debug)]
pub struct Command<'s> {
	session: &'s Session,
	id: CommandId,
	name: String,
	args: Vec<String>,
	tagged: bool,
	data: Option<String>,
}

impl<'s> Command<'s> {
	pub fn new<I, S>(session: &'s Session, name: &str, args: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Self {
			session,
			id: session.next_command_id(),
			name: name.to_string(),
			args: args.into_iter().map(Into::into).collect(),
			tagged: true,
			data: None,
		}
	}

	pub fn with_id(mut self, id: CommandId) -> Self {
		self.id = id;
		self
	}

	/// Tagged output is on by default.
	pub fn tagged(mut self, tagged: bool) -> Self {
		self.tagged = tagged;
		self
	}

	/// Input answered to the command's prompts, one line per prompt.
	pub fn with_data_set(mut self, data: impl Into<String>) -> Self {
		self.data = Some(data.into());
		self
	}

	pub fn id(&self) -> CommandId {
		self.id
	}

	/// Runs the command. Errors follow the session's throw threshold.
	pub fn run(&self) -> Result<CommandResult> {
		if let Some(data) = &self.data {
			self.session.set_data_set(self.id, Some(data.clone()));
		}
		let args: Vec<&str> = self.args.iter().map(String::as_str).collect();
		let success = self.session.run_command(&self.name, self.id, self.tagged, &args)?;
		Ok(CommandResult {
			id: self.id,
			success,
			results: self.session.results(self.id).unwrap_or_default(),
		})
	}
}

impl Drop for Command<'_> {
	fn drop(&mut self) {
		self.session.release_command(self.id);
	}
}

/// Outcome of a finished [`Command`], independent of the session.
#[derive(Debug, Clone)]
pub struct CommandResult {
	id: CommandId,
	success: bool,
	results: Arc<ResultBundle>,
}

impl CommandResult {
	pub fn id(&self) -> CommandId {
		self.id
	}

	pub fn success(&self) -> bool {
		self.success
	}

	pub fn results(&self) -> &ResultBundle {
		&self.results
	}

	pub fn errors(&self) -> &[ErrorRecord] {
		self.results.errors()
	}

	pub fn info(&self) -> &[InfoMessage] {
		self.results.info()
	}

	pub fn tagged(&self) -> &[TaggedRecord] {
		self.results.tagged()
	}

	pub fn text(&self) -> &str {
		self.results.text()
	}

	pub fn binary(&self) -> &[u8] {
		self.results.binary()
	}
}
