use std::{cell::RefCell, rc::Rc};

use threefold::{
    channel::{AsyncRecvError, AsyncSendError, Channel, SimpleChannel},
    runtime::{BoxError, Error, Runtime, Task},
};

type Log = Rc<RefCell<Vec<&'static str>>>;

fn logger(log: Log, name: &'static str) -> impl FnOnce(&mut Task<'_>) -> Result<(), BoxError> {
    move |_| {
        log.borrow_mut().push(name);
        Ok(())
    }
}

#[tokio::test]
async fn closure_on_diamond_runs_after_the_join() -> Result<(), Error> {
    let channel = SimpleChannel::channels(1).remove(0);
    let mut rt = Runtime::new(channel, 0, 1);
    let log: Log = Rc::default();

    let a = rt.add_continuation(&[], "a", logger(log.clone(), "a"))?;
    let closure = rt.add_closure(a)?;
    let l = log.clone();
    let b = rt.add_round(&[a], "b", move |_, _| {
        l.borrow_mut().push("b");
        Ok(())
    })?;
    let c = rt.add_continuation(&[a], "c", logger(log.clone(), "c"))?;
    rt.add_continuation(&[b, c], "d", logger(log.clone(), "d"))?;
    let after = rt.add_continuation(&[closure], "after", logger(log.clone(), "after"))?;

    rt.run_until_task_completes(closure).await?;
    assert!(!rt.is_done());
    {
        let log = log.borrow();
        assert_eq!(log.first(), Some(&"a"));
        assert_eq!(log.last(), Some(&"d"));
        assert_eq!(log.len(), 4);
    }
    rt.run_until_task_completes(after).await?;
    assert!(rt.is_done());
    assert_eq!(log.borrow().last(), Some(&"after"));
    Ok(())
}

#[tokio::test]
async fn parties_exchange_one_message_per_round() -> Result<(), Error> {
    let mut parties = vec![];
    for (party, channel) in SimpleChannel::channels(3).into_iter().enumerate() {
        parties.push(async move {
            let mut rt = Runtime::new(channel, party, 3);
            let received = Rc::new(RefCell::new(vec![]));
            let r = received.clone();
            rt.add_round(&[], "ring", move |comm, task| {
                comm.send_next(vec![party as u8; 3]);
                let mut pending = comm.recv_prev(3);
                task.then_continuation("store", move |_| {
                    r.borrow_mut().extend(pending.get()?);
                    Ok(())
                })?;
                Ok(())
            })?;
            // the continuation runs in the same round as the exchange
            rt.run_one_round().await?;
            assert!(rt.is_done());
            let received = received.borrow().clone();
            Ok::<_, Error>(received)
        });
    }
    let received = futures::future::try_join_all(parties).await?;
    assert_eq!(received, vec![vec![2; 3], vec![0; 3], vec![1; 3]]);
    Ok(())
}

// Logs every message that passes through, tagged with its first byte.
struct Recording {
    inner: SimpleChannel,
    log: Rc<RefCell<Vec<String>>>,
}

impl Channel for Recording {
    type SendError = AsyncSendError;
    type RecvError = AsyncRecvError;

    async fn send_bytes_to(&mut self, p: usize, msg: Vec<u8>) -> Result<(), AsyncSendError> {
        self.log.borrow_mut().push(format!("send{}", msg[0]));
        self.inner.send_bytes_to(p, msg).await
    }

    async fn recv_bytes_from(&mut self, p: usize) -> Result<Vec<u8>, AsyncRecvError> {
        let msg = self.inner.recv_bytes_from(p).await?;
        self.log.borrow_mut().push(format!("recv{}", msg[0]));
        Ok(msg)
    }
}

#[tokio::test]
async fn independent_rounds_send_before_receiving() -> Result<(), Error> {
    let mut parties = vec![];
    for (party, inner) in SimpleChannel::channels(3).into_iter().enumerate() {
        parties.push(async move {
            let log = Rc::new(RefCell::new(vec![]));
            let channel = Recording {
                inner,
                log: log.clone(),
            };
            let mut rt = Runtime::new(channel, party, 3);
            let received = Rc::new(RefCell::new(vec![]));
            for tag in [1u8, 2] {
                let r = received.clone();
                rt.add_round(&[], "exchange", move |comm, task| {
                    comm.send_next(vec![tag]);
                    let mut pending = comm.recv_prev(1);
                    task.then_continuation("store", move |_| {
                        r.borrow_mut().extend(pending.get()?);
                        Ok(())
                    })?;
                    Ok(())
                })?;
            }
            rt.run_all().await?;
            assert_eq!(*received.borrow(), vec![1, 2]);
            let log = log.borrow().clone();
            Ok::<_, Error>(log)
        });
    }
    for log in futures::future::try_join_all(parties).await? {
        assert_eq!(log, vec!["send1", "send2", "recv1", "recv2"]);
    }
    Ok(())
}
