use clap::Parser;

use agent_core::config::LogFormat;
use agent_core::AppConfig;

/// 命令行参数，优先级高于配置文件和环境变量
#[derive(Debug, Clone, Parser)]
#[command(name = "meta-agent", version, about = "分布式数据库集群的节点控制代理")]
pub struct Cli {
    /// 对外服务的IP
    #[arg(long)]
    pub ip: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    /// 代理home目录
    #[arg(long)]
    pub home: Option<String>,

    /// 配置文件路径（TOML）
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<String>,

    /// 启动时必须连上集群存储
    #[arg(long)]
    pub start_db: bool,

    /// 以接管方式启动
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
    pub take_over: u8,

    /// 升级前旧进程的pid
    #[arg(long, value_name = "PID")]
    pub old_pid: Option<u32>,

    /// 集群存储root密码
    #[arg(long, env = "AGENT_ROOT_PASSWORD", hide_env_values = true)]
    pub root_password: Option<String>,

    #[arg(short, long, value_parser = ["trace", "debug", "info", "warn", "error"])]
    pub log_level: Option<String>,

    #[arg(long, value_parser = ["json", "pretty"])]
    pub log_format: Option<String>,
}

impl Cli {
    pub fn is_take_over(&self) -> bool {
        self.take_over == 1
    }

    /// 把命令行参数覆盖到配置上并重新校验
    pub fn apply(&self, config: &mut AppConfig) -> anyhow::Result<()> {
        if let Some(ip) = &self.ip {
            config.agent.ip = ip.clone();
        }
        if let Some(port) = self.port {
            config.agent.port = port;
        }
        if let Some(home) = &self.home {
            config.agent.home = home.clone();
        }
        if let Some(password) = &self.root_password {
            config.cluster_store.password = Some(password.clone());
        }
        if let Some(level) = &self.log_level {
            config.observability.log_level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.observability.log_format = format
                .parse::<LogFormat>()
                .map_err(|e| anyhow::anyhow!(e))?;
        }
        config.validate()
    }
}
