use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use clap_verbosity_flag::Verbosity;
use colored::Colorize;
use erlang_distribution_node::{
    resolve_cookie, EpmdClient, MailboxHandle, MessageHandler, Node, NodeConfig, Term,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    verbose: Verbosity,
    /// Node name. A bare name gets `@<hostname>` appended.
    #[arg(short, long, default_value = "echo")]
    name: String,
    /// Distribution cookie. Falls back to ERLANG_COOKIE, RELEASE_COOKIE and
    /// ~/.erlang.cookie.
    #[arg(short, long)]
    cookie: Option<String>,
    /// Port to use for connecting to EPMD
    #[arg(long, default_value = "4369")]
    epmd_port: u16,
    /// Port for incoming distribution connections, 0 picks one
    #[arg(long, default_value = "0")]
    listen_port: u16,
    /// Nodes to ping once started
    #[arg(long)]
    connect: Vec<String>,
}

/// Replies `Msg` to `Pid` for every `{Pid, Msg}`.
struct Echo;

#[async_trait]
impl MessageHandler for Echo {
    async fn handle(&self, mailbox: &MailboxHandle, message: Term) {
        match (message.element(0).and_then(Term::as_pid), message.element(1)) {
            (Some(pid), Some(reply)) if message.arity() == 2 => {
                log::debug!("echo {} to {}", reply, pid);
                if let Err(err) = mailbox.send(pid, reply.clone()).await {
                    log::warn!("could not echo to {}: {}", pid, err);
                }
            }
            _ => log::info!("echo ignoring {}", message),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .init();

    let name = if args.name.contains('@') {
        args.name
    } else {
        let hostname_os = hostname::get().context("when getting hostname")?;
        let hostname = hostname_os
            .into_string()
            .ok()
            .context("hostname is not valid unicode")?;
        format!("{}@{}", args.name, hostname)
    };
    let cookie = resolve_cookie(args.cookie).context("when resolving the cookie")?;

    let config = NodeConfig::new(name, cookie).with_listen_port(args.listen_port);
    let node = Node::start(config, Arc::new(EpmdClient::new(args.epmd_port)))
        .await
        .context("when starting node")?;
    node.mailbox()
        .name("echo")
        .spawn(Echo)
        .context("when registering the echo mailbox")?;

    println!(
        "{}",
        format!("! node {} listening on port {}", node.name(), node.port()).blue()
    );
    println!(
        "Send `{{self(), Msg}}` to `{{echo, '{}'}}` and receive `Msg` back",
        node.name()
    );

    for peer in &args.connect {
        if node.ping(peer).await {
            println!("{} {}", "pong".green(), peer);
        } else {
            println!("{} {}", "pang".red(), peer);
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("when waiting for ctrl-c")?;
    println!("{}", "! shutting down".blue());
    node.close().await;
    Ok(())
}
