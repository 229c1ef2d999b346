#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => {{
        print!($($arg)*);
        std::io::Write::flush(&mut std::io::stdout())?;
    }};
}

#[macro_export]
macro_rules! status {
    ($code:expr) => {{
        use colored::Colorize as _;

        let ret = $code;
        match &ret {
            Ok(_) => println!("{}", "ok".green()),
            Err(_) => println!("{}", "failed".red()),
        }
        ret
    }};
}
