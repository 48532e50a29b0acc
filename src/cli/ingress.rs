use anyhow::Result;
use clap::Args;

use sandgate::Config;
use sandgate::ingress::IngressServer;

use super::shutdown_signal;

#[derive(Args)]
pub struct IngressArgs {
    /// Port to listen on (overrides server.port)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address to bind (overrides server.bind)
    #[arg(long)]
    pub bind: Option<String>,
}

pub async fn run(args: IngressArgs, config: &Config) -> Result<()> {
    let mut config = config.clone();
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    IngressServer::new(&config).run(shutdown_signal()).await
}
