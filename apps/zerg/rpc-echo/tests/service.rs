use core_config::nats::NatsConfig;
use nats_rpc::{
    BuildInfo, Client, Connection, Context, Json, LocalBroker, Request, Server, ServerHandle,
    UserInfo,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use zerg_rpc_echo::handlers::{self, EchoState, Greeting, Item, Stats, SUBJECT};

struct Harness {
    server: ServerHandle,
    client: Client,
    state: Arc<EchoState>,
}

impl Harness {
    async fn start() -> Self {
        let broker = LocalBroker::new();
        let events = Connection::local(&broker, Duration::from_secs(1)).await.unwrap();
        let state = Arc::new(EchoState::new(Some(Client::new(events).with_origin("rpc-echo"))));

        let server = Server::builder(NatsConfig::default().with_subject(SUBJECT))
            .router(handlers::router(Arc::clone(&state)).unwrap())
            .subscriber(handlers::subscriber(Arc::clone(&state)))
            .build_info(BuildInfo {
                version: "1.2.3".into(),
                date: "2026-01-01".into(),
                tag: "abc123".into(),
            })
            .local(&broker)
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        let connection = Connection::local(&broker, Duration::from_secs(1)).await.unwrap();
        Self {
            server,
            client: Client::new(connection).with_origin("service-tests"),
            state,
        }
    }

    async fn stop(self) {
        self.server.stop();
        self.server.stopped().await;
    }
}

fn admin() -> Context {
    Context::background().with_user_info(UserInfo::new("root").with_role("admin"))
}

#[tokio::test]
async fn test_greet_publishes_event() {
    let harness = Harness::start().await;

    let request = Request::post("/api/echo/v1/greet")
        .json(&json!({"name": "Ada", "language": "es"}))
        .unwrap()
        .build();
    let Json(greeting): Json<Greeting> = harness
        .client
        .send_and_receive_json(&Context::background(), request)
        .await
        .unwrap();
    assert_eq!(greeting.message, "¡Hola, Ada!");

    let mut stats = harness.state.stats();
    for _ in 0..100 {
        if stats.events == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        stats = harness.state.stats();
    }
    assert_eq!(stats.greeted, 1);
    assert_eq!(stats.events, 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_greet_rejects_empty_name() {
    let harness = Harness::start().await;

    let request = Request::post("/api/echo/v1/greet")
        .json(&json!({"name": ""}))
        .unwrap()
        .build();
    let err = harness
        .client
        .send_request(&Context::background(), request)
        .await
        .unwrap_err();
    assert_eq!(err.status(), 400);
    let body: Value = err.response().unwrap().json().unwrap();
    assert_eq!(body["validationErrors"][0]["field"], "name");
    assert_eq!(harness.state.stats().greeted, 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_item_reads_path_and_query() {
    let harness = Harness::start().await;

    let Json(item): Json<Item> = harness
        .client
        .send_and_receive_json(
            &Context::background(),
            Request::get("/api/echo/v1/items/42?from=10").build(),
        )
        .await
        .unwrap();
    assert_eq!(
        item,
        Item {
            id: "42".into(),
            from: Some("10".into()),
        }
    );

    harness.stop().await;
}

#[tokio::test]
async fn test_stats_require_admin() {
    let harness = Harness::start().await;
    let call = || Request::get("/api/echo/v1/stats").build();

    let err = harness
        .client
        .send_request(&Context::background(), call())
        .await
        .unwrap_err();
    assert_eq!(err.status(), 401);

    let Json(stats): Json<Stats> = harness
        .client
        .send_and_receive_json(&admin(), call())
        .await
        .unwrap();
    assert_eq!(stats.greeted, 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_whoami_returns_caller() {
    let harness = Harness::start().await;

    let Json(user): Json<UserInfo> = harness
        .client
        .send_and_receive_json(&admin(), Request::get("/api/echo/v1/whoami").build())
        .await
        .unwrap();
    assert_eq!(user.user_id.as_deref(), Some("root"));
    assert_eq!(user.role.as_deref(), Some("admin"));

    harness.stop().await;
}

#[tokio::test]
async fn test_echo_and_builtin_routes() {
    let harness = Harness::start().await;
    let ctx = Context::background();

    let response = harness
        .client
        .send_request(
            &ctx,
            Request::post("/api/echo/v1/echo").body("ping").build(),
        )
        .await
        .unwrap();
    assert_eq!(response.text(), "ping");

    let info: Value = harness
        .client
        .send_and_receive_json(&ctx, Request::get("/api/echo/v1/info").build())
        .await
        .unwrap();
    assert_eq!(
        info,
        json!({"build": {"version": "1.2.3", "date": "2026-01-01", "tag": "abc123"}})
    );

    harness.stop().await;
}
