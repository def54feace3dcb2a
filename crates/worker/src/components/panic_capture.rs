//! 子任务panic时的调用栈捕获

use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::sync::Once;

thread_local! {
    static LAST_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static INSTALL: Once = Once::new();

/// 安装panic钩子，保留原有钩子的输出，并把调用栈记到发生panic的线程上
pub(crate) fn install_hook() {
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let backtrace = Backtrace::force_capture().to_string();
            LAST_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(backtrace));
            previous(info);
        }));
    });
}

/// 取出当前线程最近一次panic的调用栈
pub(crate) fn take_backtrace() -> Option<String> {
    LAST_BACKTRACE.with(|slot| slot.borrow_mut().take())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backtrace_recorded_on_panicking_thread() {
        install_hook();
        let _ = take_backtrace();

        let result = std::panic::catch_unwind(|| panic!("boom"));
        assert!(result.is_err());
        let backtrace = take_backtrace().unwrap();
        assert!(!backtrace.is_empty());
        assert!(take_backtrace().is_none());
    }
}
