//! Mock game worker for integration testing
//!
//! Arguments:
//! - `--port N`: port to listen on (falls back to the PORT variable)
//!
//! Environment variables:
//! - STARTUP_DELAY_MS: delay before accepting connections (default: 0)
//! - HEALTH_STATUS: status line for /health (default: "200 OK")

use std::env;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn parse_port() -> u16 {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--port" {
            if let Some(port) = args.next().and_then(|p| p.parse().ok()) {
                return port;
            }
        }
    }

    env::var("PORT")
        .expect("--port argument or PORT environment variable required")
        .parse()
        .expect("PORT must be a valid port number")
}

#[tokio::main]
async fn main() {
    let port = parse_port();

    let startup_delay: u64 = env::var("STARTUP_DELAY_MS")
        .unwrap_or_else(|_| "0".to_string())
        .parse()
        .unwrap_or(0);

    if startup_delay > 0 {
        println!("Mock worker: sleeping for {}ms before starting", startup_delay);
        tokio::time::sleep(Duration::from_millis(startup_delay)).await;
    }

    let listener = TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind");

    println!("Mock worker: listening on port {}", port);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(async move {
                    handle_connection(stream).await;
                });
            }
            Err(e) => {
                eprintln!("Mock worker: accept error: {}", e);
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream) {
    let mut buf = Vec::new();
    let mut temp = [0u8; 1024];

    // Read HTTP request headers
    let header_end = loop {
        let n = match stream.read(&mut temp).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(_) => return,
        };
        buf.extend_from_slice(&temp[..n]);

        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > 8192 {
            return;
        }
    };

    let head = match std::str::from_utf8(&buf[..header_end]) {
        Ok(s) => s.to_string(),
        Err(_) => return,
    };

    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split(' ');
    let method = parts.next().unwrap_or("GET").to_string();
    let path = parts.next().unwrap_or("/").to_string();

    let headers: Vec<(String, String)> = lines
        .take_while(|l| !l.is_empty())
        .filter_map(|l| l.split_once(':'))
        .map(|(name, value)| (name.trim().to_lowercase(), value.trim().to_string()))
        .collect();

    let content_length: usize = headers
        .iter()
        .find(|(name, _)| name == "content-length")
        .and_then(|(_, value)| value.parse().ok())
        .unwrap_or(0);

    // Read the body
    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = match stream.read(&mut temp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        body.extend_from_slice(&temp[..n]);
    }

    println!("Mock worker: {} {}", method, path);

    let path_only = path.split('?').next().unwrap_or("/");
    let (status, content_type, body) = match path_only {
        "/health" => {
            let status = env::var("HEALTH_STATUS").unwrap_or_else(|_| "200 OK".to_string());
            (status, "application/json", r#"{"status":"healthy"}"#.to_string())
        }
        "/api/get-game" | "/api/get-tense-question" | "/api/get-number-game" | "/api/get-matching-game" => (
            "200 OK".to_string(),
            "application/json",
            format!(r#"{{"path":"{}","pid":{}}}"#, path_only, std::process::id()),
        ),
        "/api/headers" => {
            let fields: Vec<String> = headers
                .iter()
                .map(|(name, value)| format!("\"{}\":\"{}\"", name, value.replace('"', "\\\"")))
                .collect();
            ("200 OK".to_string(), "application/json", format!("{{{}}}", fields.join(",")))
        }
        "/api/teapot" => ("418 I'm a teapot".to_string(), "application/json", r#"{"x":1}"#.to_string()),
        "/api/slow" => {
            tokio::time::sleep(Duration::from_secs(2)).await;
            ("200 OK".to_string(), "application/json", r#"{"slow":true}"#.to_string())
        }
        _ if method == "POST" => (
            "200 OK".to_string(),
            "application/json",
            String::from_utf8_lossy(&body).into_owned(),
        ),
        _ => ("404 Not Found".to_string(), "application/json", r#"{"error":"not found"}"#.to_string()),
    };

    let response = format!(
        "HTTP/1.1 {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         X-Mock-Worker: true\r\n\
         \r\n\
         {}",
        status,
        content_type,
        body.len(),
        body
    );

    let _ = stream.write_all(response.as_bytes()).await;
}
