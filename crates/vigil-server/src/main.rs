// 视频监控聚合平台控制面
// SIP 注册服务器 + 协议编排 + 流媒体驱动 + webhook 管道 + 录像/AI 事件管理

use clap::Parser;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::info;
use vigil_server::config::Bootstrap;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[arg(short, long, default_value = "configs/config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let mut conf = Bootstrap::load(&args.config)?;
    if conf.server.http.jwt_secret.is_empty() {
        conf.server.http.jwt_secret = random_secret();
    }
    info!(config = args.config, "vigil server starting");

    vigil_server::run(conf).await
}

fn random_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}
