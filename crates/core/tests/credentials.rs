mod common;

use std::fs;

use common::{ADDRESS, server};
use p4::{AuthFailure, CommandId, ConnectionConfig, Error, LoginOptions, LogoutOptions, Session};
use p4_runtime::{EnvDefaults, TicketFile};
use tempfile::TempDir;

#[test]
fn login_ticket_is_used_by_passwordless_sessions() {
	let tmp = TempDir::new().expect("temp dir should be created");
	let tickets = tmp.path().join(".p4tickets");
	let server = server();

	let session = common::builder(&server).ticket_file(&tickets).build();
	let credential = session.login("pass", &LoginOptions::default()).expect("login should succeed");
	assert_eq!(credential.user, "admin");
	assert_eq!(credential.scope, ADDRESS);
	assert!(!credential.is_expired());

	let stored = TicketFile::new(&tickets).get(ADDRESS, "admin").expect("ticket file should read");
	assert_eq!(stored.map(|entry| entry.ticket), Some(credential.ticket.clone()));

	let passwordless = Session::builder(server.connector())
		.address(ADDRESS)
		.user("admin")
		.workspace("admin_ws")
		.ticket_file(&tickets)
		.build();
	assert_eq!(passwordless.ticket_file().as_deref(), Some(tickets.as_path()));
	assert!(passwordless.run_command("noop", CommandId(1), false, &[]).expect("ticket should authenticate"));
}

#[test]
fn logout_invalidates_and_forgets_the_ticket() {
	let tmp = TempDir::new().expect("temp dir should be created");
	let tickets = tmp.path().join(".p4tickets");
	let server = server();

	let admin = common::builder(&server).ticket_file(&tickets).build();
	admin.login("pass", &LoginOptions::default()).expect("login should succeed");

	let session = Session::builder(server.connector()).address(ADDRESS).user("admin").ticket_file(&tickets).build();
	session.connect().expect("ticket should authenticate");
	session.logout(&LogoutOptions::default()).expect("logout should succeed");

	assert_eq!(server.tickets_for("admin"), 0);
	assert!(TicketFile::new(&tickets).get(ADDRESS, "admin").expect("ticket file should read").is_none());
	assert!(!session.is_connected());

	let err = session.run_command("noop", CommandId(1), false, &[]).expect_err("no credential should remain");
	assert!(matches!(err, Error::Auth { kind: AuthFailure::PasswordRequired, .. }));
}

#[test]
fn login_with_wrong_password_is_an_auth_error() {
	let server = server();
	let session = common::session(&server);

	let err = session.login("nope", &LoginOptions::default()).expect_err("login should fail");
	assert!(matches!(err, Error::Auth { kind: AuthFailure::BadPassword, .. }));
	assert!(session.connection_error().is_some());
}

#[test]
fn denied_user_cannot_connect() {
	let server = p4::FakeServer::builder(ADDRESS).deny("mallory").build();
	let session = Session::builder(server.connector()).address(ADDRESS).user("mallory").build();

	let err = session.connect().expect_err("denied user should be refused");
	assert!(matches!(err, Error::Auth { kind: AuthFailure::AccessDenied, .. }));
}

#[test]
fn switching_ticket_file_changes_where_tickets_land() {
	let tmp = TempDir::new().expect("temp dir should be created");
	let first = tmp.path().join("first");
	let second = tmp.path().join("second");
	let server = server();

	let session = common::session(&server);
	assert!(session.ticket_file().is_none());
	session.set_ticket_file(&first);
	session.set_ticket_file(&second);
	session.login("pass", &LoginOptions::default()).expect("login should succeed");

	assert!(!first.exists());
	assert!(TicketFile::new(&second).get(ADDRESS, "admin").expect("ticket file should read").is_some());
}

#[test]
fn config_file_above_working_directory_seeds_the_session() {
	let tmp = TempDir::new().expect("temp dir should be created");
	fs::write(tmp.path().join(".p4config"), format!("P4PORT={ADDRESS}\nP4USER=admin\nP4PASSWD=pass\nP4CLIENT=admin_ws\n")).expect("config should be written");
	let nested = tmp.path().join("src").join("module");
	fs::create_dir_all(&nested).expect("nested dir should be created");

	let config = ConnectionConfig::from_path_with(&nested, &EnvDefaults::from_lookup(|_| None)).expect("config should load");
	let server = server();
	let session = Session::new(server.connector(), config);
	assert_eq!(session.address(), ADDRESS);

	session.run_command("info", CommandId(1), true, &[]).expect("info should run");
	let record = &session.tagged_output(CommandId(1)).expect("results kept")[0];
	assert_eq!(record.get("clientName"), Some("admin_ws"));
}

#[test]
fn environment_fills_what_the_config_file_leaves_out() -> anyhow::Result<()> {
	let tmp = TempDir::new()?;
	fs::write(tmp.path().join("p4.cfg"), "P4CLIENT=admin_ws\n")?;

	let env = EnvDefaults::from_lookup(|key| match key {
		"P4PORT" => Some(ADDRESS.to_string()),
		"P4USER" => Some("guest".to_string()),
		"P4CLIENT" => Some("env_ws".to_string()),
		"P4CONFIG" => Some("p4.cfg".to_string()),
		_ => None,
	});
	let config = ConnectionConfig::from_path_with(tmp.path(), &env)?;
	let values = config.values();
	assert_eq!(values.address, ADDRESS);
	assert_eq!(values.user, "guest");
	assert_eq!(values.workspace, "admin_ws");
	Ok(())
}
