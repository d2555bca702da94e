use std::sync::Arc;

use mandi_jobs::Worker;

#[tokio::main]
async fn main() {
    mandi_observability::init();

    let services = Arc::new(
        mandi_api::app::services::build_services()
            .await
            .expect("failed to build services"),
    );

    let worker = Worker::new(services.queue.clone()).start();

    let app = mandi_api::app::build_app(services.clone());

    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080")
        .await
        .expect("failed to bind 0.0.0.0:8080");

    tracing::info!("listening on {}", listener.local_addr().unwrap());

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .unwrap();

    worker.shutdown().await;
    services.realtime.shutdown();
}
