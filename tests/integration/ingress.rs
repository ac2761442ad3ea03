use crate::common::{test_client, test_client_with};
use rocket::http::{ContentType, Status};

#[test]
fn workflow_deleted_accepts_a_well_formed_body() {
    let client = test_client();
    let res = client
        .post("/api/workflow-deleted")
        .header(ContentType::JSON)
        .body(r#"{"workflow_id": "wf-1"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["success"], true);
}

#[test]
fn permission_changed_accepts_a_revoke_for_an_unknown_workspace() {
    let client = test_client();
    let res = client
        .post("/api/permission-changed")
        .header(ContentType::JSON)
        .body(r#"{"user_id": "u1", "workspace_id": "ws-nobody-joined", "is_removed": true}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
}

#[test]
fn malformed_json_body_is_reported_as_a_server_error() {
    let client = test_client();
    let res = client
        .post("/api/workflow-deleted")
        .header(ContentType::JSON)
        .body("not json")
        .dispatch();
    assert_eq!(res.status(), Status::InternalServerError);
    let body: serde_json::Value = res.into_json().unwrap();
    assert!(body["error"].is_string());
}

#[test]
fn workspace_resource_changed_dispatches_through_the_fanout_table() {
    let client = test_client();
    let res = client
        .post("/api/workspace-resource-changed")
        .header(ContentType::JSON)
        .body(
            r#"{"workspace_id": "ws-1", "resource_type": "mcp", "operation": "create", "data": {}}"#,
        )
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
}

#[test]
fn ingress_requests_without_a_configured_secret_need_no_header() {
    let client = test_client();
    let res = client
        .post("/api/workflow-deleted")
        .header(ContentType::JSON)
        .body(r#"{"workflow_id": "wf-1"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
}

#[test]
fn ingress_requests_with_a_configured_secret_require_a_matching_header() {
    let client = test_client_with(|config| {
        config.ingress_shared_secret = Some("s3cr3t".to_string());
    });

    let unauthorized = client
        .post("/api/workflow-deleted")
        .header(ContentType::JSON)
        .body(r#"{"workflow_id": "wf-1"}"#)
        .dispatch();
    assert_eq!(unauthorized.status(), Status::Unauthorized);

    let wrong_secret = client
        .post("/api/workflow-deleted")
        .header(ContentType::JSON)
        .header(rocket::http::Header::new("X-Ingress-Secret", "nope"))
        .body(r#"{"workflow_id": "wf-1"}"#)
        .dispatch();
    assert_eq!(wrong_secret.status(), Status::Unauthorized);

    let authorized = client
        .post("/api/workflow-deleted")
        .header(ContentType::JSON)
        .header(rocket::http::Header::new("X-Ingress-Secret", "s3cr3t"))
        .body(r#"{"workflow_id": "wf-1"}"#)
        .dispatch();
    assert_eq!(authorized.status(), Status::Ok);
}

#[test]
fn workspace_resource_changed_rejects_a_combination_absent_from_the_table() {
    let client = test_client();
    let res = client
        .post("/api/workspace-resource-changed")
        .header(ContentType::JSON)
        .body(
            r#"{"workspace_id": "ws-1", "resource_type": "env", "operation": "create", "data": {}}"#,
        )
        .dispatch();
    assert_eq!(res.status(), Status::InternalServerError);
}
