use std::sync::Arc;
use std::time::Duration;

use http::HeaderValue;
use indoc::indoc;
use micro_host::{HostConfig, HostPipelineBuilder, Http1Connection};
use micro_host_core::{
    Application, ApplicationCall, BoxError, CancelReason, Execution, ExecutionError, Interceptor, Pipeline, async_trait,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

#[derive(Debug)]
struct Routes;

#[async_trait]
impl Interceptor for Routes {
    async fn intercept(&self, call: &mut ApplicationCall, execution: &mut Execution) -> Result<(), BoxError> {
        let path = call.request().path().to_owned();
        match path.as_str() {
            "/hello" => call.response_mut().respond("hello")?,
            "/echo" => {
                let body = call.request_mut().receive_bytes().await?;
                call.response_mut().respond(body)?;
            }
            "/stream" => {
                let writer = call.response_mut().respond_streaming()?;
                writer.write("a").await?;
                writer.write("b").await?;
            }
            "/slow" => {
                tokio::time::sleep(Duration::from_millis(50)).await;
                call.response_mut().respond("slow")?;
            }
            "/fail" => return Err("boom".into()),
            "/partial" => {
                let writer = call.response_mut().respond_streaming()?;
                writer.write("partial").await?;
                return Err("failed mid-body".into());
            }
            "/wait" => futures::future::pending::<()>().await,
            _ => return Ok(()),
        }
        execution.finish();
        Ok(())
    }
}

#[derive(Debug)]
struct Stamp;

#[async_trait]
impl Interceptor for Stamp {
    async fn intercept(&self, call: &mut ApplicationCall, _execution: &mut Execution) -> Result<(), BoxError> {
        call.response_mut().insert_header("x-host", HeaderValue::from_static("micro"))?;
        Ok(())
    }
}

/// Reports every call it sees, and how the ones that fail end.
#[derive(Debug)]
struct Watch {
    started: mpsc::UnboundedSender<String>,
    failures: mpsc::UnboundedSender<ExecutionError>,
}

#[async_trait]
impl Interceptor for Watch {
    async fn intercept(&self, call: &mut ApplicationCall, execution: &mut Execution) -> Result<(), BoxError> {
        let failures = self.failures.clone();
        execution.on_fail(move |_call, e| {
            let _ = failures.send(e.clone());
        });
        let _ = self.started.send(call.request().path().to_owned());
        Ok(())
    }
}

fn request(raw: &str) -> String {
    raw.replace('\n', "\r\n")
}

fn application() -> Arc<Application> {
    let mut pipeline = Pipeline::application();
    pipeline.intercept(&Pipeline::CALL, Routes).unwrap();
    Arc::new(Application::new(pipeline))
}

/// Writes `input`, shuts down the client's write side and reads everything
/// the server answers.
async fn serve(input: String) -> String {
    let host_pipeline = Arc::new(HostPipelineBuilder::new().intercept(&Pipeline::PLUGINS, Stamp).unwrap().build());
    let config = Arc::new(HostConfig { send_date: false, half_close: true, ..HostConfig::default() });

    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server);
    let connection = Http1Connection::new(server_read, server_write, config);
    let task = tokio::spawn(connection.process(application(), host_pipeline));

    let (mut client_read, mut client_write) = tokio::io::split(client);
    client_write.write_all(input.as_bytes()).await.unwrap();
    client_write.shutdown().await.unwrap();

    let mut output = String::new();
    client_read.read_to_string(&mut output).await.unwrap();
    let _ = task.await.unwrap();
    output
}

#[tokio::test]
async fn handled_request() {
    let output = serve(request(indoc! {"
        GET /hello HTTP/1.1
        Host: localhost

    "}))
    .await;

    assert!(output.starts_with("HTTP/1.1 200 OK\r\n"), "{output}");
    assert!(output.contains("x-host: micro\r\n"));
    assert!(output.contains("content-length: 5\r\n"));
    assert!(output.ends_with("\r\n\r\nhello"));
}

#[tokio::test]
async fn unhandled_request_is_not_found() {
    let output = serve(request(indoc! {"
        GET /missing?page=2 HTTP/1.1
        Host: localhost

    "}))
    .await;

    assert!(output.starts_with("HTTP/1.1 404 Not Found\r\n"), "{output}");
    assert!(output.ends_with("Cannot find resource with the requested URI: /missing?page=2"));
}

#[tokio::test]
async fn failed_request_is_internal_server_error() {
    let output = serve(request(indoc! {"
        GET /fail HTTP/1.1
        Host: localhost

    "}))
    .await;

    assert!(output.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{output}");
    assert!(output.contains("content-length: 0\r\n"));
}

#[tokio::test]
async fn request_body_reaches_the_call() {
    let output = serve(request(indoc! {"
        POST /echo HTTP/1.1
        Host: localhost
        Content-Length: 11

        hello world"}))
    .await;

    assert!(output.starts_with("HTTP/1.1 200 OK\r\n"), "{output}");
    assert!(output.ends_with("\r\n\r\nhello world"));
}

#[tokio::test]
async fn chunked_request_body_reaches_the_call() {
    let output = serve(request(indoc! {"
        POST /echo HTTP/1.1
        Host: localhost
        Transfer-Encoding: chunked

        5
        hello
        6
         world
        0

    "}))
    .await;

    assert!(output.ends_with("\r\n\r\nhello world"), "{output}");
}

#[tokio::test]
async fn streaming_response_is_chunked() {
    let output = serve(request(indoc! {"
        GET /stream HTTP/1.1
        Host: localhost

    "}))
    .await;

    assert!(output.contains("transfer-encoding: chunked\r\n"), "{output}");
    assert!(output.ends_with("\r\n\r\n1\r\na\r\n1\r\nb\r\n0\r\n\r\n"));
}

#[tokio::test]
async fn pipelined_responses_keep_request_order() {
    let output = serve(request(indoc! {"
        GET /slow HTTP/1.1
        Host: localhost

        GET /hello HTTP/1.1
        Host: localhost

    "}))
    .await;

    let slow = output.find("slow").unwrap();
    let hello = output.find("hello").unwrap();
    assert!(slow < hello, "{output}");
    assert_eq!(output.matches("HTTP/1.1 200 OK").count(), 2);
}

#[tokio::test]
async fn unread_body_is_skipped_before_the_next_request() {
    let output = serve(request(indoc! {"
        POST /hello HTTP/1.1
        Host: localhost
        Content-Length: 7

        ignoredGET /missing HTTP/1.1
        Host: localhost

    "}))
    .await;

    assert!(output.starts_with("HTTP/1.1 200 OK\r\n"), "{output}");
    assert!(output.contains("HTTP/1.1 404 Not Found\r\n"));
    assert!(output.ends_with("Cannot find resource with the requested URI: /missing"));
}

#[tokio::test]
async fn connection_close_stops_after_the_response() {
    let output = serve(request(indoc! {"
        GET /hello HTTP/1.1
        Host: localhost
        Connection: close

        GET /hello HTTP/1.1
        Host: localhost

    "}))
    .await;

    assert_eq!(output.matches("HTTP/1.1 200 OK").count(), 1, "{output}");
}

#[tokio::test]
async fn expect_continue_is_acknowledged() {
    let output = serve(request(indoc! {"
        POST /echo HTTP/1.1
        Host: localhost
        Expect: 100-continue
        Content-Length: 2

        ok"}))
    .await;

    assert!(output.starts_with("HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\n"), "{output}");
    assert!(output.ends_with("\r\n\r\nok"));
}

#[tokio::test]
async fn malformed_request_is_bad_request() {
    let output = serve(request(indoc! {"
        GET /hello HTTP/1.1
        Host: localhost
        Content-Length: nope

    "}))
    .await;

    assert!(output.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{output}");
}

#[tokio::test]
async fn failure_after_streaming_does_not_end_the_body() {
    let output = serve(request(indoc! {"
        GET /partial HTTP/1.1
        Host: localhost

    "}))
    .await;

    assert!(output.starts_with("HTTP/1.1 200 OK\r\n"), "{output}");
    assert!(output.contains("transfer-encoding: chunked\r\n"));
    assert!(!output.ends_with("0\r\n\r\n"), "truncated body ended cleanly: {output}");
}

#[tokio::test]
async fn client_disconnect_cancels_the_call() {
    let (started_tx, mut started) = mpsc::unbounded_channel();
    let (failures_tx, mut failures) = mpsc::unbounded_channel();
    let watch = Watch { started: started_tx, failures: failures_tx };
    let host_pipeline = Arc::new(HostPipelineBuilder::new().intercept(&Pipeline::PLUGINS, watch).unwrap().build());
    let config = Arc::new(HostConfig { send_date: false, ..HostConfig::default() });

    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server);
    let connection = Http1Connection::new(server_read, server_write, config);
    let task = tokio::spawn(connection.process(application(), host_pipeline));

    client.write_all(request("GET /wait HTTP/1.1\nHost: localhost\n\n").as_bytes()).await.unwrap();
    assert_eq!(started.recv().await.as_deref(), Some("/wait"));
    drop(client);

    let failure = tokio::time::timeout(Duration::from_secs(1), failures.recv()).await.unwrap().unwrap();
    assert_eq!(failure.cancel_reason(), Some(&CancelReason::ConnectionClosed));
    let finished = tokio::time::timeout(Duration::from_secs(1), task).await;
    assert!(finished.is_ok(), "connection task kept running after the client left");
}

#[tokio::test]
async fn input_sent_during_an_exchange_waits_for_it() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server);
    let config = Arc::new(HostConfig { send_date: false, ..HostConfig::default() });
    let host_pipeline = Arc::new(HostPipelineBuilder::new().build());
    let task = tokio::spawn(Http1Connection::new(server_read, server_write, config).process(application(), host_pipeline));

    let (mut client_read, mut client_write) = tokio::io::split(client);
    client_write.write_all(request("GET /slow HTTP/1.1\nHost: localhost\n\n").as_bytes()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    client_write.write_all(request("GET /hello HTTP/1.1\nHost: localhost\nConnection: close\n\n").as_bytes()).await.unwrap();

    let mut output = String::new();
    client_read.read_to_string(&mut output).await.unwrap();
    let _ = task.await.unwrap();

    let slow = output.find("slow").unwrap();
    let hello = output.find("hello").unwrap();
    assert!(slow < hello, "{output}");
    assert_eq!(output.matches("HTTP/1.1 200 OK").count(), 2);
}
