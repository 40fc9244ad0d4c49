use actix_web::{App, HttpRequest, HttpResponse, HttpServer, Responder, get, middleware, web::Data};
use clap::Parser;
use kube::api::Api;
use kube::runtime::events::Reporter;
use kube::runtime::reflector::store::Writer;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::*;

use operator::client::KubeClient;
use operator::config::Env;
use operator::controller::{KubeVirtController, informer};
use operator::crd::KubeVirt;
use operator::helper::get_my_namespace;
use operator::install::{StrategyCache, dump_install_strategy_to_config_map};
use operator::stores::StoreWriters;
use operator::telemetry;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Store the install strategy of this environment in a config map and exit
    #[arg(long)]
    dump_install_strategy: bool,

    /// Number of reconcile workers
    #[arg(long, env = "VIRT_OPERATOR_THREADINESS", default_value_t = 3)]
    threadiness: usize,

    #[arg(long, env = "VIRT_OPERATOR_JSON_LOGS")]
    json_logs: bool,

    #[arg(long, default_value_t = 8186)]
    health_port: u16,
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<Arc<KubeVirtController>>, _req: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json(c.diagnostics())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    telemetry::init(args.json_logs);

    let env = Env::from_process();
    let namespace = get_my_namespace()?;
    let client = kube::Client::try_default().await?;
    let reporter = Reporter {
        controller: "virt-operator".into(),
        instance: std::env::var("POD_NAME").ok(),
    };
    let cluster = Arc::new(KubeClient::new(client.clone(), reporter));

    if args.dump_install_strategy {
        dump_install_strategy_to_config_map(cluster.as_ref(), &env, &namespace).await?;
        return Ok(());
    }
    env.verify()?;

    let writers = StoreWriters::default();
    let kubevirts = Writer::<KubeVirt>::default();
    let controller = Arc::new(KubeVirtController::new(
        cluster,
        kubevirts.as_reader(),
        writers.as_stores(),
        env,
        namespace.clone(),
        Arc::new(StrategyCache::new()),
    ));

    let mut informers: Vec<_> = writers
        .into_informers(client.clone(), &namespace, controller.clone())
        .into_iter()
        .map(tokio::spawn)
        .collect();
    informers.push(tokio::spawn(informer::watch_kubevirts(
        Api::all(client),
        kubevirts,
        controller.clone(),
    )));

    let data = controller.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(data.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
    })
    .bind(("0.0.0.0", args.health_port))?
    .shutdown_timeout(5)
    .run();
    let server_handle = server.handle();

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for the shutdown signal: {e}");
        }
        info!("shutting down");
        shutdown.cancel();
        server_handle.stop(true).await;
    });

    // Both implement graceful shutdown, so poll until both are done
    let (controller_result, server_result) = tokio::join!(controller.run(args.threadiness, cancel), server);
    for informer in informers {
        informer.abort();
    }
    server_result?;
    controller_result?;
    Ok(())
}
