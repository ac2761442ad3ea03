use rocket::local::blocking::Client;
use tempfile::TempDir;
use workflow_broker::config::BrokerConfig;

/// Wrapper around `Client` that keeps the backing temp directory alive for
/// the lifetime of the test, the way the teacher's `TestClient` keeps its
/// temp DB file alive until drop.
pub struct TestClient {
    client: Client,
    _dir: TempDir,
}

impl std::ops::Deref for TestClient {
    type Target = Client;
    fn deref(&self) -> &Client {
        &self.client
    }
}

pub fn test_client() -> TestClient {
    test_client_with(|_| {})
}

/// Like [`test_client`] but lets the caller tweak the config before the
/// Rocket instance is built — for example to set `ingress_shared_secret`.
pub fn test_client_with(configure: impl FnOnce(&mut BrokerConfig)) -> TestClient {
    let dir = TempDir::new().expect("failed to create temp dir");
    let db_path = dir.path().join("broker.db");

    let mut config = BrokerConfig::default();
    config.database_path = db_path.to_string_lossy().to_string();
    configure(&mut config);

    let rocket = workflow_broker::rocket_with_config(config);
    let client = Client::tracked(rocket).expect("valid rocket instance");
    TestClient { client, _dir: dir }
}
