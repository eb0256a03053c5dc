use std::time::Duration;

use assert_matches::assert_matches;
use mockito::Server;
use tree_harvest::download::{
    Backoff, DownloadOutcome, DownloadSettings, Downloader, ReqwestTransport, RetryPolicy,
};

fn settings(max_attempts: u32) -> DownloadSettings {
    DownloadSettings {
        retry: RetryPolicy {
            max_attempts,
            backoff: Backoff::Fixed(Duration::from_millis(1)),
        },
        request_delay: Duration::ZERO,
        timeout: Duration::from_secs(5),
        ..DownloadSettings::default()
    }
}

fn downloader(max_attempts: u32) -> Downloader<ReqwestTransport> {
    let transport = ReqwestTransport::new(Duration::from_secs(5)).unwrap();
    Downloader::new(transport, settings(max_attempts))
}

#[test]
fn fetches_body() {
    let mut server = Server::new();
    let mock = server
        .mock("GET", "/files/tree.nwk")
        .with_status(200)
        .with_body("((A,B),C);")
        .create();

    let url = format!("{}/files/tree.nwk", server.url());
    let outcome = downloader(3).download(&url, 10).unwrap();

    mock.assert();
    assert_eq!(outcome, DownloadOutcome::Fetched(b"((A,B),C);".to_vec()));
}

#[test]
fn server_errors_use_whole_budget() {
    let mut server = Server::new();
    let mock = server
        .mock("GET", "/flaky")
        .with_status(503)
        .expect(3)
        .create();

    let url = format!("{}/flaky", server.url());
    let outcome = downloader(3).download(&url, 0).unwrap();

    mock.assert();
    assert_matches!(outcome, DownloadOutcome::Exhausted { attempts: 3 });
    assert_eq!(outcome.into_parts(), (false, Vec::new()));
}

#[test]
fn oversized_declaration_is_never_requested() {
    let mut server = Server::new();
    let mock = server.mock("GET", "/big.zip").expect(0).create();

    let url = format!("{}/big.zip", server.url());
    let outcome = downloader(3).download(&url, 11 * 1024 * 1024).unwrap();

    mock.assert();
    assert_matches!(outcome, DownloadOutcome::TooLarge { .. });
}
