use lsp::{Params, Server};

fn main() {
    let server = Server::new(9090, Params::default()).unwrap();
    println!(">>> Listening on port 9090");

    loop {
        match server.read() {
            Ok((conn_id, payload)) => {
                println!(">>> [{}] {:?}", conn_id, String::from_utf8_lossy(&payload));

                if let Err(err) = server.write(conn_id, &payload) {
                    println!(">>> [{conn_id}] echo failed: {err}");
                }
            }
            Err(err) => {
                println!(">>> {err}");
            }
        }
    }
}
