// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use company_events::{
    channel::BrokerConnections,
    company::InMemoryCompanyService,
    configs::{AppConfigs, PUBLISHER_CONNECT_ATTEMPTS},
    dispatcher::Dispatcher,
    events::{CompanyEvents, PublishingCompanyService},
    health::ReadinessReport,
    publisher::RabbitMQPublisher,
    subscriber::EventSubscriber,
    topology::OUTBOUND_EXCHANGE,
};
use std::{error::Error, sync::Arc};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv::dotenv().ok();

    let cfg = AppConfigs::from_env();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.log_level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    cfg.validate()?;

    let connections = BrokerConnections::new(&cfg.name);

    let publisher = RabbitMQPublisher::new(connections.publisher.clone(), OUTBOUND_EXCHANGE);
    if let Some(url) = &cfg.rabbitmq.url {
        if let Err(err) = publisher
            .connect(url, PUBLISHER_CONNECT_ATTEMPTS, cfg.reconnect.base_delay)
            .await
        {
            // outbound events are dropped until restart
            error!(error = err.to_string(), "publisher unavailable");
        }
    }

    let service = PublishingCompanyService::new(
        InMemoryCompanyService::new(),
        CompanyEvents::new(publisher.clone(), &cfg.name),
    );

    let subscriber = EventSubscriber::new(
        cfg.rabbitmq.url.clone(),
        connections.subscriber.clone(),
        Dispatcher::for_company_service(Arc::new(service)),
    )
    .with_retry_policy(cfg.retry)
    .with_reconnect_policy(cfg.reconnect);

    info!("starting rabbitmq subscriber...");
    // the first connect may hang on an unresponsive broker
    let started = tokio::select! {
        result = subscriber.start() => Some(result),
        _ = shutdown_signal() => None,
    };

    let outcome = match started {
        Some(Ok(())) => {
            let report = ReadinessReport::from_subscriber(&subscriber);
            info!(
                status = ?report.status,
                http_status = report.http_status(),
                "readiness after startup"
            );

            shutdown_signal().await;
            Ok(())
        }
        Some(Err(err)) => {
            error!(error = err.to_string(), "event subscriber could not start");
            Err(err)
        }
        None => Ok(()),
    };
    info!("shutting down gracefully");

    subscriber.close().await;
    publisher.close().await;

    outcome?;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            error!(error = err.to_string(), "failure to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
