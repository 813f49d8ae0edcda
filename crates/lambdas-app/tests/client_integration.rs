use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lambdas_app::types::{Configuration, FieldType, Payload, Settings, WatchLeaf};
use lambdas_app::{AppClient, AppError, AppModule, Route};
use lambdas_rpc::{
    AppAway, HostMethod, POLICY_VIOLATION, RpcError, RpcHandler, RpcPeer, handshake, param,
};
use serde_json::{Value, json};
use tokio::io::{BufReader, duplex};
use tokio::sync::mpsc;

/// Host stand-in: records what the app registered and answers with fixed settings.
struct FakeHost {
    settings: Settings,
    registered: mpsc::UnboundedSender<(Vec<Configuration>, Vec<Vec<WatchLeaf>>)>,
}

#[async_trait]
impl RpcHandler for FakeHost {
    type Method = HostMethod;

    async fn handle(&self, _method: HostMethod, params: Vec<Value>) -> anyhow::Result<Value> {
        let configs: Vec<Configuration> = param(&params, 0, "register")?;
        let observed: Vec<Vec<WatchLeaf>> = param(&params, 1, "register")?;
        let _ = self.registered.send((configs, observed));
        Ok(serde_json::to_value(&self.settings)?)
    }
}

fn transfer_module(fired: Arc<AtomicUsize>) -> AppModule {
    let leaf = WatchLeaf::event("polkadot", "event.Balances.Transfer");
    AppModule::new()
        .config(Configuration::setting("threshold", FieldType::Number))
        .route(
            Route::builder([leaf])
                .trigger(|p, ctx| {
                    let threshold = ctx.setting("threshold").and_then(Value::as_u64).unwrap_or(0);
                    Ok(p.get("amount").and_then(Value::as_u64).unwrap_or(0) > threshold)
                })
                .lambda(move |_, _| {
                    let fired = fired.clone();
                    async move {
                        fired.fetch_add(1, Ordering::SeqCst);
                        anyhow::Ok(())
                    }
                })
                .build(),
        )
}

#[tokio::test]
async fn registered_app_evaluates_pushed_payloads() {
    let (app_io, host_io) = duplex(8192);
    let (ar, aw) = tokio::io::split(app_io);
    let (hr, mut hw) = tokio::io::split(host_io);

    let (registered_tx, mut registered_rx) = mpsc::unbounded_channel();
    let mut settings = Settings::new();
    settings.insert("threshold".into(), json!(1000));

    let host = tokio::spawn(async move {
        let mut reader = BufReader::new(hr);
        let hello = handshake::read_hello(&mut reader).await.unwrap();
        assert_eq!(hello.token, "tok-1");
        handshake::accept(&mut hw).await.unwrap();

        let peer = RpcPeer::new();
        let app = AppAway::new(peer.caller());
        let handler = Arc::new(FakeHost {
            settings,
            registered: registered_tx,
        });
        tokio::spawn(peer.run(reader, hw, handler));
        app
    });

    let fired = Arc::new(AtomicUsize::new(0));
    let client = AppClient::handshake(BufReader::new(ar), aw, "tok-1", "transfers")
        .await
        .unwrap();
    let running = tokio::spawn(client.run(transfer_module(fired.clone())));

    let app = host.await.unwrap();
    let (configs, observed) = registered_rx.recv().await.unwrap();
    assert_eq!(configs.len(), 1);
    assert_eq!(observed.len(), 1);
    assert_eq!(observed[0][0].path, "event.Balances.Transfer");

    let leaf = observed[0][0].clone();
    for amount in [500, 5000] {
        let payload = Payload::event(&leaf, json!({ "amount": amount }));
        app.push_payload(0, &payload).await.unwrap();
    }
    let missing = app
        .push_payload(4, &Payload::event(&leaf, json!({})))
        .await
        .unwrap_err();
    assert!(matches!(missing, RpcError::Remote(ref m) if m.contains("no route at index 4")));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    running.abort();
}

#[tokio::test]
async fn settings_pushed_later_replace_registered_ones() {
    let (app_io, host_io) = duplex(8192);
    let (ar, aw) = tokio::io::split(app_io);
    let (hr, mut hw) = tokio::io::split(host_io);
    let (registered_tx, mut registered_rx) = mpsc::unbounded_channel();

    let host = tokio::spawn(async move {
        let mut reader = BufReader::new(hr);
        handshake::read_hello(&mut reader).await.unwrap();
        handshake::accept(&mut hw).await.unwrap();
        let peer = RpcPeer::new();
        let app = AppAway::new(peer.caller());
        let mut settings = Settings::new();
        settings.insert("threshold".into(), json!(1000));
        tokio::spawn(peer.run(
            reader,
            hw,
            Arc::new(FakeHost {
                settings,
                registered: registered_tx,
            }),
        ));
        app
    });

    let fired = Arc::new(AtomicUsize::new(0));
    let logs = Arc::new(Mutex::new(Vec::new()));
    let client = AppClient::handshake(BufReader::new(ar), aw, "tok-2", "transfers")
        .await
        .unwrap()
        .with_logs(logs.clone());
    let running = tokio::spawn(client.run(transfer_module(fired.clone())));
    let app = host.await.unwrap();
    registered_rx.recv().await.unwrap();
    // Let the client apply the registration reply before overriding it.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut lowered = Settings::new();
    lowered.insert("threshold".into(), json!(10));
    app.set_settings(&lowered).await.unwrap();

    let leaf = WatchLeaf::event("polkadot", "event.Balances.Transfer");
    app.push_payload(0, &Payload::event(&leaf, json!({ "amount": 500 })))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(logs.lock().unwrap().is_empty());
    running.abort();
}

#[tokio::test]
async fn rejected_token_fails_before_registration() {
    let (app_io, host_io) = duplex(1024);
    let (ar, aw) = tokio::io::split(app_io);
    let (hr, mut hw) = tokio::io::split(host_io);

    tokio::spawn(async move {
        let mut reader = BufReader::new(hr);
        handshake::read_hello(&mut reader).await.unwrap();
        handshake::reject(&mut hw, POLICY_VIOLATION, "unknown session token")
            .await
            .unwrap();
    });

    let err = AppClient::handshake(BufReader::new(ar), aw, "bogus", "x")
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        AppError::Rpc(RpcError::Rejected {
            code: POLICY_VIOLATION,
            ..
        })
    ));
}
