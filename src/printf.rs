//! 定义系统内核的输出方法

use core::fmt;
use core::sync::atomic::Ordering;

#[cfg(not(feature = "std"))]
use spin::Once;

use crate::driver::PANICKED;
use crate::spinlock::SpinLock;

/// 控制台的单字符输出函数，由内核在启动时通过 [`set_console`] 注册
#[cfg(not(feature = "std"))]
static CONSOLE: Once<fn(u8)> = Once::new();

/// 注册控制台输出函数。只有第一次调用生效，未注册前的输出会被丢弃。
#[cfg(not(feature = "std"))]
pub fn set_console(putc: fn(u8)) {
    CONSOLE.call_once(|| putc);
}

/// 零大小类型（ZST）的打印结构体，用于在多个 CPU 之间对打印操作进行排序。
struct Print;

impl fmt::Write for Print {
    /// 将字符串写入控制台
    #[cfg(not(feature = "std"))]
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if let Some(putc) = CONSOLE.get() {
            for byte in s.bytes() {
                putc(byte);
            }
        }
        Ok(())
    }

    /// 宿主环境下写到标准输出
    #[cfg(feature = "std")]
    fn write_str(&mut self, s: &str) -> fmt::Result {
        std::print!("{}", s);
        Ok(())
    }
}

/// 核心打印函数（被宏调用）
///
/// # 功能说明
/// 根据系统状态决定是否加锁输出：
/// - 当系统处于panic状态时，直接输出（不加锁）
/// - 正常状态下使用自旋锁保证多核输出不交错
///
/// # 注意
/// 此函数被声明为pub，因为需要在宏中调用
pub fn _print(args: fmt::Arguments<'_>) {
    use fmt::Write;
    static PRINT: SpinLock<()> = SpinLock::new((), "print");

    if PANICKED.load(Ordering::Relaxed) {
        // no need to lock
        let _ = Print.write_fmt(args);
    } else {
        let guard = PRINT.lock();
        let _ = Print.write_fmt(args);
        drop(guard);
    }
}

/// 在终端输出一串字符
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::printf::_print(format_args!($($arg)*));
    };
}

/// 在终端输出一行字符
#[macro_export]
macro_rules! println {
    () => {$crate::print!("\n")};
    ($fmt:expr) => {$crate::print!(concat!($fmt, "\n"))};
    ($fmt:expr, $($arg:tt)*) => {
        $crate::print!(concat!($fmt, "\n"), $($arg)*)
    };
}

/// 全局panic处理函数
///
/// # 功能说明
/// 1. 设置全局panic状态标志，之后的输出不再加锁
/// 2. 打印panic信息
/// 3. 挂起当前硬件线程（无限循环）
#[cfg(not(any(feature = "std", test)))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    PANICKED.store(true, Ordering::Relaxed);
    crate::println!("{}", info);
    loop {}
}
