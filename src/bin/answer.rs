use std::os::unix::net::UnixListener;

use courier::{Config, FdPort, LocalFs, Role, Session};

fn main() {
    let path = std::env::args().nth(1).unwrap_or_else(|| "/tmp/courier.sock".into());
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();

    println!(">>> Waiting for a caller on {}...", path);
    let (stream, _) = listener.accept().unwrap();
    println!(">>> Caller connected");

    let mut session =
        Session::start(FdPort::new(stream), LocalFs, Role::Called, Config::default()).unwrap();
    session.serve().unwrap();

    println!(">>> Session finished");
}
