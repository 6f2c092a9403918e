//! Research Flow Example
//!
//! A supervisor hands research requests to two researchers. One researcher
//! polls its queue, the other is served by a push-style consumer, and both
//! reply with findings the supervisor collects at the end.
//!
//! Run with `RUST_LOG=conclave_mesh=debug` to watch messages move through the
//! router and queues.

use conclave_mesh::{
    AgentCommunicationHub, HubConfig, MeshContext, MeshResult, Message, Payload, RouterConfig,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    println!("==============================================");
    println!("     Research Flow Example - Conclave Mesh");
    println!("==============================================");
    println!();

    let context = MeshContext::new(RouterConfig {
        poll_interval: Duration::from_millis(20),
        ..Default::default()
    })?;
    let hub = Arc::new(AgentCommunicationHub::new(context, HubConfig::default())?);
    hub.start().await?;

    for agent in ["supervisor", "researcher_1", "researcher_2"] {
        let mut info = Payload::new();
        info.insert("role".into(), json!(agent.split('_').next().unwrap_or(agent)));
        hub.register_agent(agent, Some(info)).await;
    }
    println!("Registered agents: {:?}", hub.registered_agents().await);

    // researcher_2 answers from a consumer loop
    let responder = Arc::clone(&hub);
    hub.add_agent_consumer(
        "researcher_2",
        "researcher_2_worker",
        Arc::new(move |request: Message| {
            let hub = Arc::clone(&responder);
            async move {
                let topic = request.payload["subtopic_brief"]["topic"].clone();
                let sent = hub
                    .send_research_result(
                        "researcher_2",
                        &request.sender_id,
                        json!({"topic": topic, "summary": "answered by consumer"}),
                        Some(request.message_id.to_string()),
                    )
                    .await;
                MeshResult::Ok(sent)
            }
        }),
    )
    .await?;

    hub.send_research_request("supervisor", "researcher_1", json!({"topic": "tidal energy"}), None)
        .await;
    hub.send_research_request("supervisor", "researcher_2", json!({"topic": "wave farms"}), None)
        .await;

    // researcher_1 polls
    tokio::time::sleep(Duration::from_millis(100)).await;
    for request in hub.get_agent_messages("researcher_1", 10).await {
        println!(
            "researcher_1 received {} ({})",
            request.message_type, request.payload["subtopic_brief"]
        );
        let mut findings = Payload::new();
        findings.insert(
            "research_findings".into(),
            json!({"summary": "answered by polling"}),
        );
        hub.send_message(request.create_reply("researcher_1", findings, None))
            .await;
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    println!();
    println!("Supervisor inbox:");
    for reply in hub.get_agent_messages("supervisor", 10).await {
        println!(
            "  {} from {} (correlation {:?}): {}",
            reply.message_type,
            reply.sender_id,
            reply.correlation_id,
            serde_json::Value::Object(reply.payload.clone())
        );
    }

    println!();
    println!("{}", serde_json::to_string_pretty(&hub.stats().await)?);

    hub.stop().await;
    Ok(())
}
