use crate::common::test_client;
use rocket::http::Status;

#[test]
fn health_reports_zero_rooms_on_a_fresh_broker() {
    let client = test_client();
    let res = client.get("/health").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "workflow-broker");
    assert_eq!(body["workflowRooms"], 0);
    assert_eq!(body["workspaceRooms"], 0);
    assert_eq!(body["connections"], 0);
}
