//! S3 publisher against a mock S3 endpoint.

use uuid::Uuid;
use wiremock::matchers::{body_bytes, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pagesnap_jobs::{
    ArtifactPublisher, Credentials, PublishError, RasterImage, S3Config, S3Publisher,
};

fn publisher(server: &MockServer) -> S3Publisher {
    let config = S3Config::new(
        "shots",
        Credentials {
            access_key_id: "AKIDEXAMPLE".into(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".into(),
            session_token: None,
        },
    )
    .with_endpoint(server.uri())
    .with_region("eu-west-1");
    S3Publisher::new(config).expect("Failed to create publisher")
}

fn image() -> RasterImage {
    RasterImage {
        data: b"\x89PNG fake bytes".to_vec(),
        width: 1,
        height: 1,
    }
}

fn stored() -> ResponseTemplate {
    ResponseTemplate::new(200).insert_header("ETag", "\"9b2cf535f27731c974343645a3985328\"")
}

#[tokio::test]
async fn test_publish_puts_keyed_public_png() {
    let server = MockServer::start().await;
    let id = Uuid::now_v7();

    Mock::given(method("PUT"))
        .and(path(format!("/shots/{id}.png")))
        .and(header("content-type", "image/png"))
        .and(header("x-amz-acl", "public-read"))
        .and(header_exists("authorization"))
        .and(header_exists("x-amz-date"))
        .and(header_exists("x-amz-content-sha256"))
        .and(body_bytes(image().data))
        .respond_with(stored())
        .expect(1)
        .mount(&server)
        .await;

    let locator = publisher(&server).publish(id, &image()).await.unwrap();

    assert_eq!(
        locator.as_str(),
        format!("{}/shots/{id}.png", server.uri())
    );
}

#[tokio::test]
async fn test_republish_same_job_uses_same_key() {
    let server = MockServer::start().await;
    let id = Uuid::now_v7();

    Mock::given(method("PUT"))
        .and(path(format!("/shots/{id}.png")))
        .respond_with(stored())
        .expect(2)
        .mount(&server)
        .await;

    let publisher = publisher(&server);
    let first = publisher.publish(id, &image()).await.unwrap();
    let second = publisher.publish(id, &image()).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_forbidden_maps_to_permission_denied() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(403).set_body_string(
            "<Error><Code>AccessDenied</Code><Message>Access Denied</Message></Error>",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let err = publisher(&server)
        .publish(Uuid::now_v7(), &image())
        .await
        .unwrap_err();
    assert!(matches!(err, PublishError::PermissionDenied(_)), "{err:?}");
}

#[tokio::test]
async fn test_server_error_is_unavailable_without_retry() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let err = publisher(&server)
        .publish(Uuid::now_v7(), &image())
        .await
        .unwrap_err();
    assert!(matches!(err, PublishError::Unavailable(_)), "{err:?}");
}

#[tokio::test]
async fn test_missing_bucket_is_rejected() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(404).set_body_string(
            "<Error><Code>NoSuchBucket</Code></Error>",
        ))
        .mount(&server)
        .await;

    let err = publisher(&server)
        .publish(Uuid::now_v7(), &image())
        .await
        .unwrap_err();
    assert!(matches!(err, PublishError::Rejected(_)), "{err:?}");
}

#[tokio::test]
async fn test_empty_buffer_sends_nothing() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .respond_with(stored())
        .expect(0)
        .mount(&server)
        .await;

    let empty = RasterImage {
        data: Vec::new(),
        width: 0,
        height: 0,
    };
    let err = publisher(&server)
        .publish(Uuid::now_v7(), &empty)
        .await
        .unwrap_err();
    assert_eq!(err, PublishError::EmptyBuffer);
}

#[tokio::test]
async fn test_unreachable_endpoint_is_unavailable() {
    let server = MockServer::start().await;
    let publisher = publisher(&server);
    drop(server);

    let err = publisher.publish(Uuid::now_v7(), &image()).await.unwrap_err();
    assert!(matches!(err, PublishError::Unavailable(_)), "{err:?}");
}
