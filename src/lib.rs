//! 节点控制代理进程：命令行、主目录与pid文件、启动身份恢复和优雅关闭。

pub mod app;
pub mod cli;
pub mod pidfile;
pub mod shutdown;
