//! 代理主目录、pid文件与升级检测

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

/// 主目录下启动时创建的子目录
pub const HOME_SUBDIRS: [&str; 4] = ["bin", "lib", "etc", "run"];

const PROC_ROOT: &str = "/proc";
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// 创建主目录及其子目录，返回规范化后的主目录
pub fn prepare_home(home: &Path) -> Result<PathBuf> {
    for dir in HOME_SUBDIRS {
        let path = home.join(dir);
        fs::create_dir_all(&path).with_context(|| format!("创建目录失败: {}", path.display()))?;
    }
    home.canonicalize()
        .with_context(|| format!("解析主目录失败: {}", home.display()))
}

/// 写入当前进程的pid
pub fn write_pid_file(path: &Path) -> Result<()> {
    fs::write(path, std::process::id().to_string())
        .with_context(|| format!("写入pid文件失败: {}", path.display()))?;
    info!(pid = std::process::id(), "pid文件已写入: {}", path.display());
    Ok(())
}

pub fn read_pid_file(path: &Path) -> Result<u32> {
    let content =
        fs::read_to_string(path).with_context(|| format!("读取pid文件失败: {}", path.display()))?;
    content
        .trim()
        .parse()
        .with_context(|| format!("pid文件内容无效: {}", path.display()))
}

/// 退出时删除pid文件，文件已被新进程覆盖时保留
pub fn remove_pid_file(path: &Path) {
    match read_pid_file(path) {
        Ok(pid) if pid == std::process::id() => {
            if let Err(e) = fs::remove_file(path) {
                warn!("删除pid文件失败 {}: {}", path.display(), e);
            }
        }
        Ok(pid) => info!(pid, "pid文件已属于其他进程，保留"),
        Err(e) => warn!("{:#}", e),
    }
}

/// 旧进程的工作目录与主目录相同即为同一代理的升级
pub fn is_upgrade(old_pid: u32, home: &Path) -> bool {
    is_upgrade_in(Path::new(PROC_ROOT), old_pid, home)
}

fn is_upgrade_in(proc_root: &Path, old_pid: u32, home: &Path) -> bool {
    let cwd = proc_root.join(old_pid.to_string()).join("cwd");
    match (fs::read_link(&cwd), home.canonicalize()) {
        (Ok(old_cwd), Ok(home)) => old_cwd == home,
        (Err(e), _) => {
            info!(old_pid, "旧进程不存在或无法读取工作目录: {}", e);
            false
        }
        (_, Err(e)) => {
            warn!("解析主目录失败 {}: {}", home.display(), e);
            false
        }
    }
}

/// 等待旧进程退出，超时返回false
pub async fn wait_for_exit(old_pid: u32, wait: Duration) -> bool {
    wait_for_exit_in(Path::new(PROC_ROOT), old_pid, wait).await
}

async fn wait_for_exit_in(proc_root: &Path, old_pid: u32, wait: Duration) -> bool {
    let process_dir = proc_root.join(old_pid.to_string());
    let deadline = tokio::time::Instant::now() + wait;
    while process_dir.exists() {
        if tokio::time::Instant::now() >= deadline {
            warn!(old_pid, "等待旧进程退出超时");
            return false;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
    info!(old_pid, "旧进程已退出");
    true
}
