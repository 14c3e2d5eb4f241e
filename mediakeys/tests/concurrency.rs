use mediakeys::{
    AesCipher, Buffer, CdmInstance, Cipher, CipherMode, ClearKey, Decryptor, DrmSystemId,
    EncryptedSampleMetadata, Error as DrmError, Flow, InitData, InitDataType, KeyWait, Negotiator,
    Notification, ProtectionEvent, WaitOutcome, jwk_set,
};
use std::{
    error::Error,
    sync::{Arc, mpsc},
    thread,
    time::{Duration, Instant},
};

const KID: [u8; 16] = [0x11; 16];
const KEY: [u8; 16] = [0x42; 16];
const NEXT_KID: [u8; 16] = [0x12; 16];
const NEXT_KEY: [u8; 16] = [0x43; 16];

fn key_ids() -> InitData {
    InitData::new(
        InitDataType::KeyIds,
        br#"{"kids":["EREREREREREREREREREREQ"]}"#.to_vec(),
    )
}

fn encrypted_buffer(plaintext: &[u8], kid: [u8; 16], key: [u8; 16], sequence_id: u64) -> Buffer {
    let iv = [sequence_id as u8; 16];
    let mut data = plaintext.to_vec();
    AesCipher
        .decrypt(CipherMode::AesCtr, &key, &iv, &mut data)
        .unwrap();

    Buffer::new(data)
        .with_protection(EncryptedSampleMetadata::new(kid.to_vec(), iv.to_vec()))
        .with_event(ProtectionEvent::new(
            sequence_id,
            DrmSystemId::CLEARKEY,
            key_ids(),
        ))
}

#[test]
fn flush_wakes_every_waiter_on_one_wait() {
    let wait = Arc::new(KeyWait::new());
    let deadline = Instant::now() + Duration::from_secs(30);

    let waiters = (0..8)
        .map(|_| {
            let wait = wait.clone();
            thread::spawn(move || wait.wait_for_key(deadline, 0))
        })
        .collect::<Vec<_>>();

    thread::sleep(Duration::from_millis(50));
    wait.flush_start().unwrap();

    for waiter in waiters {
        assert_eq!(waiter.join().unwrap(), WaitOutcome::Flushing);
    }
    assert!(Instant::now() < deadline);
}

#[test]
fn flush_unblocks_every_stream() -> Result<(), Box<dyn Error>> {
    let negotiator = Negotiator::new();
    negotiator.attach_instance(CdmInstance::new(ClearKey::new()));

    let mut handles = vec![];
    let mut streams = vec![];
    for i in 0..4 {
        let mut decryptor = Decryptor::builder()
            .name(format!("stream-{i}"))
            .timeout(Duration::from_secs(30))
            .build(negotiator.clone());
        handles.push(decryptor.flush_handle());
        streams.push(thread::spawn(move || {
            let mut buffer = encrypted_buffer(&[0; 32], KID, KEY, 1);
            let flow = decryptor.transform(&mut buffer);
            (flow, buffer.protection.is_some())
        }));
    }

    let started = Instant::now();
    thread::sleep(Duration::from_millis(100));
    for handle in &handles {
        handle.start()?;
    }

    for stream in streams {
        let (flow, kept_metadata) = stream.join().unwrap();
        assert_eq!(flow?, Flow::Flushing);
        assert!(kept_metadata);
    }
    assert!(started.elapsed() < Duration::from_secs(10));

    for handle in &handles {
        handle.stop();
    }
    Ok(())
}

#[test]
fn stream_resumes_after_flush() -> Result<(), Box<dyn Error>> {
    let (sender, receiver) = mpsc::channel();
    let negotiator = Negotiator::builder().notifier(sender).build();
    let instance = CdmInstance::new(ClearKey::new());
    negotiator.attach_instance(instance.clone());

    let mut decryptor = Decryptor::builder()
        .timeout(Duration::from_secs(30))
        .build(negotiator);
    let flush = decryptor.flush_handle();

    let plaintext = (0..48).map(|x| x as u8 ^ 0x5C).collect::<Vec<_>>();
    let stream = {
        let plaintext = plaintext.clone();
        thread::spawn(move || {
            let mut buffer = encrypted_buffer(&plaintext, KID, KEY, 1);
            let flow = decryptor.transform(&mut buffer);
            (decryptor, buffer, flow)
        })
    };

    loop {
        match receiver.recv_timeout(Duration::from_secs(10))? {
            Notification::WaitingForKey { .. } => break,
            _ => continue,
        }
    }
    flush.start()?;

    let (mut decryptor, flushed, flow) = stream.join().unwrap();
    assert_eq!(flow?, Flow::Flushing);
    assert!(flushed.protection.is_some());
    flush.stop();

    let session = instance.session_for(&key_ids())?;
    session.generate_request(&key_ids())?;
    session.update(&jwk_set(&[(KID, KEY)])?)?;

    let started = Instant::now();
    let mut buffer = encrypted_buffer(&plaintext, KID, KEY, 2);
    assert_eq!(decryptor.transform(&mut buffer)?, Flow::Decrypted);
    assert_eq!(buffer.data, plaintext);
    assert!(started.elapsed() < Duration::from_secs(5));
    Ok(())
}

#[test]
fn key_wait_is_bounded_by_timeout() {
    let negotiator = Negotiator::new();
    negotiator.attach_instance(CdmInstance::new(ClearKey::new()));
    let mut decryptor = Decryptor::builder()
        .timeout(Duration::from_millis(200))
        .build(negotiator);

    let started = Instant::now();
    let mut buffer = encrypted_buffer(&[0; 32], KID, KEY, 1);
    let result = decryptor.transform(&mut buffer);
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(DrmError::Unsupported(_))));
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(3));
}

#[test]
fn key_rotation_during_decrypts() -> Result<(), Box<dyn Error>> {
    let negotiator = Negotiator::new();
    let instance = CdmInstance::new(ClearKey::new());
    negotiator.attach_instance(instance.clone());

    let session = instance.session_for(&key_ids())?;
    session.generate_request(&key_ids())?;
    session.update(&jwk_set(&[(KID, KEY)])?)?;

    let rotation = {
        let session = session.clone();
        thread::spawn(move || -> Result<(), DrmError> {
            for _ in 0..200 {
                session.update(&jwk_set(&[(KID, KEY), (NEXT_KID, NEXT_KEY)])?)?;
                assert!(session.update(br#"{"keys":[]}"#).is_err());
                assert!(session.is_ready());
            }
            Ok(())
        })
    };

    let plaintext = (0..64).collect::<Vec<u8>>();
    let mut decryptor = Decryptor::builder().build(negotiator);
    for sequence_id in 1..=200 {
        let mut buffer = encrypted_buffer(&plaintext, KID, KEY, sequence_id);
        assert_eq!(decryptor.transform(&mut buffer)?, Flow::Decrypted);
        assert_eq!(buffer.data, plaintext);
    }

    rotation.join().unwrap()?;

    let mut buffer = encrypted_buffer(&plaintext, NEXT_KID, NEXT_KEY, 201);
    assert_eq!(decryptor.transform(&mut buffer)?, Flow::Decrypted);
    assert_eq!(buffer.data, plaintext);
    Ok(())
}

#[test]
fn waiting_stream_follows_reattached_instance() -> Result<(), Box<dyn Error>> {
    let negotiator = Negotiator::new();
    negotiator.attach_instance(CdmInstance::new(ClearKey::new()));

    let plaintext = vec![0xC3; 40];
    let stream = {
        let negotiator = negotiator.clone();
        let plaintext = plaintext.clone();
        thread::spawn(move || -> Result<Vec<u8>, DrmError> {
            let mut decryptor = Decryptor::builder()
                .timeout(Duration::from_secs(10))
                .build(negotiator);
            let mut buffer = encrypted_buffer(&plaintext, KID, KEY, 1);
            assert_eq!(decryptor.transform(&mut buffer)?, Flow::Decrypted);
            Ok(buffer.data)
        })
    };

    thread::sleep(Duration::from_millis(100));
    let detached = negotiator.detach_instance().ok_or("nothing attached")?;
    thread::sleep(Duration::from_millis(50));
    assert!(!stream.is_finished());

    let replacement = CdmInstance::new(ClearKey::new());
    negotiator.attach_instance(replacement.clone());
    let session = replacement.session_for(&key_ids())?;
    session.generate_request(&key_ids())?;
    session.update(&jwk_set(&[(KID, KEY)])?)?;

    assert_eq!(stream.join().unwrap()?, plaintext);
    assert!(detached.is_closed());
    assert_eq!(replacement.sessions().len(), 1);
    Ok(())
}
