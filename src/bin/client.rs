use std::io::{self, BufRead};

use lsp::{Client, Params};

fn main() {
    println!(">>> Trying to connect to server...");
    let mut client = Client::new("127.0.0.1:9090", Params::default()).unwrap();
    println!(">>> Connected with id {}", client.conn_id());

    for line in io::stdin().lock().lines() {
        let line = line.unwrap();
        if line.is_empty() {
            break;
        }

        client.write(line.as_bytes()).unwrap();

        let reply = client.read().unwrap();
        println!(">>> {:?}", String::from_utf8_lossy(&reply));
    }

    client.close();
}
