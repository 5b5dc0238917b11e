mod common;

use std::thread;
use std::time::Duration;

use common::{server, session, wait_until};
use p4::{CommandId, CommandState, ConnectFailure, Error, SessionState, codes};

#[test]
fn cancelling_a_prompt_requires_reconnect() {
	let server = server();
	let session = session(&server);
	session.set_prompt_handler(|request| {
		while !request.cancel.is_cancelled() {
			thread::sleep(Duration::from_millis(5));
		}
		Some("too late".to_string())
	});

	let running = {
		let session = session.clone();
		thread::spawn(move || session.run_command("passwd", CommandId(1), false, &[]))
	};
	assert!(wait_until(Duration::from_secs(2), || !server.executed().is_empty()));
	assert!(session.cancel_command(CommandId(1)));

	let err = running.join().expect("command thread should not panic").expect_err("cancelled command should error");
	match &err {
		Error::Cancelled { id, errors } => {
			assert_eq!(*id, CommandId(1));
			assert!(errors.iter().any(|err| err.code == codes::COMMAND_CANCELLED));
		}
		other => panic!("expected cancellation, got {other:?}"),
	}
	assert!(err.is_cancelled());
	assert_eq!(session.command_state(CommandId(1)), Some(CommandState::Cancelled));
	assert_eq!(session.state(), SessionState::Failed);

	let err = session.run_command("noop", CommandId(2), false, &[]).expect_err("session should demand a reconnect");
	assert!(matches!(err, Error::Connect { kind: ConnectFailure::ReconnectRequired, .. }));

	session.reconnect().expect("reconnect should succeed");
	assert!(session.run_command("noop", CommandId(3), false, &[]).expect("noop should run after reconnect"));
}

#[test]
fn cancellation_is_reported_even_without_threshold() {
	let server = server();
	let session = common::builder(&server).throw_threshold(None).build();

	let running = {
		let session = session.clone();
		thread::spawn(move || session.run_command("wait", CommandId(4), false, &["5000"]))
	};
	assert!(wait_until(Duration::from_secs(2), || !server.executed().is_empty()));
	session.cancel_command(CommandId(4));

	let err = running.join().expect("command thread should not panic").expect_err("cancelled command should error");
	assert!(err.is_cancelled());
	session.connect().expect("explicit connect clears the reconnect requirement");
	assert_eq!(session.state(), SessionState::Connected);
}

#[test]
fn cancelling_a_finished_command_is_a_no_op() {
	let server = server();
	let session = session(&server);
	session.run_command("noop", CommandId(1), false, &[]).expect("noop should run");

	assert!(!session.cancel_command(CommandId(1)));
	assert!(!session.cancel_command(CommandId(99)));
	assert!(session.run_command("noop", CommandId(2), false, &[]).expect("session stays usable"));
}

#[test]
fn prompt_handler_answers_on_owner_thread() {
	let server = server();
	let session = session(&server);
	session.set_prompt_handler(|request| {
		let answer = if request.message.contains("old") { "pass" } else { "s3cret" };
		assert!(!request.echo);
		Some(answer.to_string())
	});

	assert!(session.run_command("passwd", CommandId(1), false, &[]).expect("passwd should run"));
	let info = session.info_results(CommandId(1)).expect("results kept");
	assert_eq!(info[0].text, "Password updated.");
}

#[test]
fn prompts_off_the_owner_thread_use_the_data_set() {
	let server = server();
	let session = session(&server);
	session.set_prompt_handler(|_| panic!("handler belongs to another thread"));

	let elsewhere = thread::spawn(|| thread::current().id()).join().expect("thread should not panic");
	session.set_thread_owner(CommandId(1), elsewhere);
	session.set_data_set(CommandId(1), Some("pass\nfresh\nfresh\n".to_string()));

	assert!(session.run_command("passwd", CommandId(1), false, &[]).expect("passwd should run from the data set"));
	assert_eq!(session.data_set(CommandId(1)).as_deref(), Some("pass\nfresh\nfresh\n"));
}

#[test]
fn exhausted_data_set_answers_empty() {
	let server = server();
	let session = common::builder(&server).throw_threshold(None).build();
	session.set_data_set(CommandId(1), Some("pass\n".to_string()));

	let ok = session.run_command("passwd", CommandId(1), false, &[]).expect("never-throw mode should not error");
	assert!(ok, "empty new passwords still match");
}

#[test]
fn cancel_while_connecting_is_reported_as_cancelled() {
	let server = server();
	server.set_connect_delay(Duration::from_millis(300));
	let session = session(&server);

	let running = {
		let session = session.clone();
		thread::spawn(move || session.run_command("noop", CommandId(1), false, &[]))
	};
	assert!(wait_until(Duration::from_secs(2), || session.command_state(CommandId(1)) == Some(CommandState::Pending)));
	assert!(session.cancel_command(CommandId(1)));

	let err = running.join().expect("command thread should not panic").expect_err("cancel accepted while connecting should win");
	assert!(err.is_cancelled());
	assert_eq!(session.command_state(CommandId(1)), Some(CommandState::Cancelled));
	assert!(server.executed().is_empty(), "cancelled command reached the server");

	server.set_connect_delay(Duration::ZERO);
	session.reconnect().expect("reconnect should succeed");
	assert!(session.run_command("noop", CommandId(2), false, &[]).expect("noop should run after reconnect"));
}
