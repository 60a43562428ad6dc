//! Loopback servers for tests.

use brpc_server::{Server, ServerConfig, Service};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Args {
    pub num1: i64,
    pub num2: i64,
}

/// `Foo.Sum` adds; `Foo.Sleep` sleeps `num1` milliseconds, then adds.
pub fn foo_service() -> Service {
    Service::builder("Foo", ())
        .method("Sum", |_: &(), args: Args, reply: &mut i64| {
            *reply = args.num1 + args.num2;
            Ok::<_, String>(())
        })
        .method("Sleep", |_: &(), args: Args, reply: &mut i64| {
            std::thread::sleep(Duration::from_millis(args.num1 as u64));
            *reply = args.num1 + args.num2;
            Ok::<_, String>(())
        })
        .build()
        .unwrap()
}

/// A `Foo` whose methods always fail.
pub fn failing_foo_service() -> Service {
    Service::builder("Foo", ())
        .method("Sum", |_: &(), _: Args, _: &mut i64| Err("sum unavailable"))
        .method("Sleep", |_: &(), _: Args, _: &mut i64| Err("sleep unavailable"))
        .build()
        .unwrap()
}

/// A `Foo` whose `Sum` waits `delay` and then fails with `error`, or adds
/// when `error` is `None`.
pub fn delayed_foo_service(delay: Duration, error: Option<&'static str>) -> Service {
    Service::builder("Foo", ())
        .method("Sum", move |_: &(), args: Args, reply: &mut i64| {
            std::thread::sleep(delay);
            match error {
                Some(text) => Err(text),
                None => {
                    *reply = args.num1 + args.num2;
                    Ok(())
                }
            }
        })
        .build()
        .unwrap()
}

pub async fn spawn_server(config: ServerConfig, service: Service) -> (SocketAddr, Arc<Server>) {
    let server = Arc::new(Server::new(config));
    server.register(service).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept = server.clone();
    tokio::spawn(async move { accept.accept(listener).await });
    (addr, server)
}

pub fn sum_calls(server: &Server) -> u64 {
    server
        .registry()
        .get("Foo")
        .and_then(|service| service.method("Sum").map(|m| m.call_count()))
        .unwrap_or(0)
}
