//! Negotiation and RPC over simulated TCP: two peers converge to the
//! Banana phase and immediately exchange one call/answer pair.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use banana_core::broker::{Broker, BrokerConfig};
use banana_core::env::Environment;
use banana_core::failure::RemoteFailure;
use banana_core::negotiate::{
    HostLookup, Negotiation, NegotiationConfig, NegotiationHost,
};
use banana_core::reference::{Args, LocalRef, Referenceable, SturdyRef, TubRef};
use banana_core::transport::Transport;
use banana_core::tub::{Tub, TubHandle};
use banana_core::value::Value;
use banana_harness::{drive_negotiation, SimEnv, SimTransport};

struct Adder;

impl Referenceable for Adder {
    fn do_remote_call(&self, method: &str, args: Args) -> Result<Value, RemoteFailure> {
        match method {
            "add" => {
                let int = |name: &str| match args.get(name) {
                    Some(Value::Int(i)) => Ok(*i),
                    _ => Err(RemoteFailure::new("TypeError", format!("bad argument {}", name))),
                };
                Ok(Value::Int(int("a")? + int("b")?))
            }
            other => Err(RemoteFailure::new("AttributeError", format!("no method {}", other))),
        }
    }
}

struct AnonymousHost {
    tub: TubHandle,
}

impl NegotiationHost for AnonymousHost {
    fn lookup(&mut self, tub_id: Option<&str>) -> HostLookup {
        match tub_id {
            None => HostLookup::Found { my_tub_id: None },
            Some(_) => HostLookup::Unknown,
        }
    }

    fn is_duplicate(&mut self, peer: &TubRef) -> bool {
        self.tub.lock().has_broker_for(peer)
    }
}

fn to_io<E: std::fmt::Display>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

async fn pump_out<S: AsyncWriteExt + Unpin>(broker: &mut Broker, stream: &mut S) -> io::Result<()> {
    let mut out = BytesMut::new();
    broker.pump(&mut out).map_err(to_io)?;
    if !out.is_empty() {
        stream.write_all(&out).await?;
    }
    Ok(())
}

#[test]
fn negotiated_pair_exchanges_one_call() {
    let mut sim = turmoil::Builder::new()
        .simulation_duration(Duration::from_secs(120))
        .build();

    sim.host("server", || async {
        let env = SimEnv::new();
        let tub = Tub::anonymous().handle();
        tub.lock().set_location(vec!["server:443".to_string()]);
        tub.lock().publish_named(LocalRef::new(Arc::new(Adder)), "adder");

        let transport = SimTransport::bind("0.0.0.0:443").await?;
        let (send, recv) = transport.accept().await?;
        let mut stream = recv.unsplit(send);

        let machine = Negotiation::server(NegotiationConfig::default());
        let mut host = AnonymousHost { tub: tub.clone() };
        let switched = drive_negotiation(&mut stream, machine, &mut host, &env)
            .await
            .map_err(to_io)?;
        assert!(switched.is_master, "with no identities the server decides");

        let mut broker =
            Broker::new(BrokerConfig::default(), Some(tub), switched.peer);
        broker.feed(&switched.leftover).map_err(|e| to_io(e.error))?;

        let mut buf = [0u8; 4096];
        loop {
            pump_out(&mut broker, &mut stream).await?;
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break, // client finished
                Ok(n) => {
                    if let Err(fatal) = broker.feed(&buf[..n]) {
                        return Err(to_io(fatal.error).into());
                    }
                }
            }
        }
        broker.connection_lost();
        Ok(())
    });

    sim.client("client", async {
        let env = SimEnv::new();
        let stream = SimTransport::connect_to("server:443").await?;
        let (recv, send) = tokio::io::split(stream);
        let mut stream = recv.unsplit(send);

        let target = SturdyRef::parse("pbu://server:443/adder").map_err(to_io)?;
        let machine =
            Negotiation::client(NegotiationConfig::default(), &target, "server", None);
        let mut host = AnonymousHost { tub: Tub::anonymous().handle() };
        let switched = drive_negotiation(&mut stream, machine, &mut host, &env)
            .await
            .map_err(to_io)?;
        assert!(!switched.is_master);

        let mut broker = Broker::new(BrokerConfig::default(), None, switched.peer);
        broker.feed(&switched.leftover).map_err(|e| to_io(e.error))?;

        // resolve the published adder, then call it
        let mut lookup = broker.get_reference_by_name("adder");
        let handle = loop {
            pump_out(&mut broker, &mut stream).await?;
            if let Some(outcome) = lookup.try_result() {
                match outcome.map_err(to_io)? {
                    Value::Remote(handle) => break handle,
                    other => panic!("expected a remote reference, got {:?}", other.kind()),
                }
            }
            read_some(&mut stream, &mut broker).await?;
        };

        let mut call = broker.call_remote(
            &handle,
            "add",
            vec![],
            BTreeMap::from([
                ("a".to_string(), Value::Int(1)),
                ("b".to_string(), Value::Int(2)),
            ]),
        );
        let result = loop {
            pump_out(&mut broker, &mut stream).await?;
            if let Some(outcome) = call.try_result() {
                break outcome.map_err(to_io)?;
            }
            read_some(&mut stream, &mut broker).await?;
        };
        assert_eq!(result, Value::Int(3));

        drop(handle);
        pump_out(&mut broker, &mut stream).await?; // best-effort decref
        broker.connection_lost();
        Ok(())
    });

    sim.run().expect("simulation failed");
}

async fn read_some<S: AsyncReadExt + Unpin>(
    stream: &mut S,
    broker: &mut Broker,
) -> io::Result<()> {
    let mut buf = [0u8; 4096];
    tokio::select! {
        read = stream.read(&mut buf) => match read {
            Ok(0) => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed")),
            Ok(n) => {
                broker.feed(&buf[..n]).map_err(|e| to_io(e.error))?;
                Ok(())
            }
            Err(e) => Err(e),
        },
        () = tokio::time::sleep(Duration::from_millis(20)) => Ok(()),
    }
}

#[test]
fn negotiation_timeout_drops_silent_clients() {
    let mut sim = turmoil::Builder::new()
        .simulation_duration(Duration::from_secs(180))
        .build();

    sim.host("server", || async {
        let env = SimEnv::new();
        let tub = Tub::anonymous().handle();
        let transport = SimTransport::bind("0.0.0.0:443").await?;
        let (send, recv) = transport.accept().await?;
        let mut stream = recv.unsplit(send);

        let machine = Negotiation::server(NegotiationConfig {
            server_timeout: Duration::from_secs(5),
        });
        let mut host = AnonymousHost { tub };
        let started = env.now();
        let result = drive_negotiation(&mut stream, machine, &mut host, &env).await;
        assert!(result.is_err(), "a mute client must not hold the slot open");
        assert!(env.now() - started >= Duration::from_secs(5));
        Ok(())
    });

    sim.client("client", async {
        // connect and say nothing
        let stream = SimTransport::connect_to("server:443").await?;
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(stream);
        Ok(())
    });

    sim.run().expect("simulation failed");
}
