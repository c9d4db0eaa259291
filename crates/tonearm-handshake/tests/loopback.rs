use std::sync::Arc;

use once_cell::sync::Lazy;
use tokio::io::AsyncReadExt;
use tonearm_core::{memory_link_pair, ErrorKind};
use tonearm_handshake::peer::{scripted_rejection, scripted_upgrade, ServerHandshake};
use tonearm_handshake::{
    AuthFailure, ClientHandshake, Credentials, HandshakeConfig, HandshakeError, HandshakeState,
    RsaKeyPair, Sha1Puzzle,
};

static RSA_KEY: Lazy<RsaKeyPair> = Lazy::new(|| RsaKeyPair::generate().expect("rsa keygen"));

fn client(password: &str) -> ClientHandshake {
    let config = HandshakeConfig::default().with_rsa_key(RSA_KEY.clone());
    ClientHandshake::new(config, Credentials::new("listener", password)).expect("client init")
}

#[tokio::test]
async fn completes_against_reference_peer() {
    let (mut client_link, mut server_link) = memory_link_pair(8192);
    let mut handshake = client("hunter2");
    let server = ServerHandshake::new("hunter2");

    let (client_res, server_res) = tokio::join!(
        handshake.run(&mut client_link),
        server.accept(&mut server_link)
    );
    let session = client_res.expect("client authenticated");
    let server_session = server_res.expect("server accepted");

    assert_eq!(handshake.state(), HandshakeState::Authenticated);
    assert_eq!(session.username(), "listener");
    assert_eq!(session.rsa_modulus(), RSA_KEY.modulus());
    assert_eq!(&server_session.client_rsa_modulus, RSA_KEY.modulus());
    // The reference peer signs nothing; login does not check the blob.
    assert_eq!(session.server_blob().len(), 256);

    let keys = session.keys();
    assert_ne!(keys.send_key, keys.recv_key);
    assert_ne!(keys.send_key, [0u8; 32]);
    assert_ne!(keys.recv_key, [0u8; 32]);
    assert_eq!(keys.send_key, server_session.keys().recv_key);
    assert_eq!(keys.recv_key, server_session.keys().send_key);

    let (mut client_send, mut client_recv) = session.into_ciphers();
    let (mut server_send, mut server_recv) = server_session.into_ciphers();
    let up = client_send.seal(0x39, b"abc").expect("seal up");
    let frame = server_recv.open(&up).expect("server opens");
    assert_eq!(&frame.payload[..], b"abc");
    let down = server_send.seal(0x04, &[0; 4]).expect("seal down");
    let frame = client_recv.open(&down).expect("client opens");
    assert_eq!(frame.command, 0x04);
}

#[tokio::test]
async fn nonexistent_user_fails_without_further_packets() {
    let (mut client_link, mut server_link) = memory_link_pair(8192);
    let mut handshake = client("irrelevant");

    let (client_res, server_res) = tokio::join!(
        handshake.run(&mut client_link),
        scripted_rejection(&mut server_link, 0x03)
    );
    let hello = server_res.expect("peer saw hello");
    assert_eq!(hello.username, "listener");

    let err = client_res.expect_err("login rejected");
    assert_eq!(err.kind(), ErrorKind::Authentication);
    assert_eq!(err.auth_failure(), Some(&AuthFailure::NonexistentUser));
    assert_eq!(handshake.state(), HandshakeState::Failed);

    drop(client_link);
    let mut trailing = Vec::new();
    server_link
        .read_to_end(&mut trailing)
        .await
        .expect("drain peer side");
    assert!(trailing.is_empty(), "client wrote after rejection");
}

#[tokio::test]
async fn upgrade_notice_is_surfaced() {
    let (mut client_link, mut server_link) = memory_link_pair(8192);
    let mut handshake = client("irrelevant");

    let (client_res, server_res) = tokio::join!(
        handshake.run(&mut client_link),
        scripted_upgrade(&mut server_link, "Upgrade to 0.4.3.383.g278a6e51 now")
    );
    server_res.expect("peer saw hello");
    match client_res.expect_err("upgrade required").auth_failure() {
        Some(AuthFailure::UpgradeRequired {
            message,
            suggested_revision,
        }) => {
            assert!(message.contains("0.4.3.383"));
            assert_eq!(*suggested_revision, Some(40_300_383));
        }
        other => panic!("unexpected failure {other:?}"),
    }
}

#[tokio::test]
async fn wrong_password_is_bad_credentials() {
    let (mut client_link, mut server_link) = memory_link_pair(8192);
    let mut handshake = client("wrong");
    let server = ServerHandshake::new("right");

    let (client_res, server_res) = tokio::join!(
        handshake.run(&mut client_link),
        server.accept(&mut server_link)
    );
    assert!(server_res.is_err());
    let err = client_res.expect_err("credentials rejected");
    assert_eq!(err.auth_failure(), Some(&AuthFailure::BadCredentials(0x01)));
    assert_eq!(handshake.state(), HandshakeState::Failed);
}

#[tokio::test]
async fn closed_link_is_a_connection_error() {
    let (mut client_link, server_link) = memory_link_pair(8192);
    drop(server_link);
    let mut handshake = client("pw");
    let err = handshake
        .run(&mut client_link)
        .await
        .expect_err("peer gone");
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert_eq!(handshake.state(), HandshakeState::Failed);
}

#[tokio::test]
async fn finished_handshake_cannot_rerun() {
    let (mut client_link, server_link) = memory_link_pair(8192);
    drop(server_link);
    let mut handshake = client("pw");
    let _ = handshake.run(&mut client_link).await;
    assert!(matches!(
        handshake.run(&mut client_link).await,
        Err(HandshakeError::AlreadyFinished(HandshakeState::Failed))
    ));
}

#[tokio::test]
async fn unsolvable_puzzle_fails_the_handshake() {
    let (mut client_link, mut server_link) = memory_link_pair(8192);
    let server = tokio::spawn(async move {
        ServerHandshake::new("hunter2")
            .accept(&mut server_link)
            .await
    });
    let config = HandshakeConfig::default()
        .with_rsa_key(RSA_KEY.clone())
        .with_puzzle_solver(Arc::new(Sha1Puzzle::default().with_max_attempts(0)));
    let mut handshake =
        ClientHandshake::new(config, Credentials::new("listener", "hunter2")).expect("client init");

    let err = handshake
        .run(&mut client_link)
        .await
        .expect_err("solver gave up");
    assert!(matches!(err, HandshakeError::Solver(_)));
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert_eq!(handshake.state(), HandshakeState::Failed);

    drop(client_link);
    assert!(server.await.expect("join").is_err());
}
