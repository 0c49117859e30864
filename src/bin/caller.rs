use std::os::unix::net::UnixStream;

use courier::{Config, FdPort, LocalFs, Role, SendRequest, Session};

fn main() {
    let mut args = std::env::args().skip(1);
    let usage = "usage: caller <socket> <from> <to>";
    let path = args.next().expect(usage);
    let from = args.next().expect(usage);
    let to = args.next().expect(usage);

    println!(">>> Connecting to {}...", path);
    let stream = UnixStream::connect(&path).unwrap();
    println!(">>> Connected");

    let mut session =
        Session::start(FdPort::new(stream), LocalFs, Role::Caller, Config::default()).unwrap();

    let req = SendRequest {
        from,
        to,
        user: std::env::var("USER").unwrap_or_else(|_| "courier".into()),
        ..SendRequest::default()
    };
    let outcome = session.send_file(&req).unwrap();
    println!(">>> {:?}", outcome);

    session.hangup().unwrap();
    println!(">>> Hung up");
}
