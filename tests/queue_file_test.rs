use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use spool_forwarder::queue::{ELEMENT_HEADER_LENGTH, ElementQueue};
use spool_forwarder::storage::{MINIMUM_LENGTH, QUEUE_HEADER_LENGTH, StorageError};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::path::PathBuf;
use tempfile::TempDir;

const MAX_SIZE: u64 = 8 * MINIMUM_LENGTH;

fn queue_path(dir: &TempDir) -> PathBuf {
    dir.path().join("queue.tape")
}

fn create_queue(dir: &TempDir) -> ElementQueue {
    ElementQueue::open(queue_path(dir), MAX_SIZE).unwrap()
}

fn write_element(queue: &mut ElementQueue, data: &[u8]) -> Result<(), StorageError> {
    let mut writer = queue.element_writer()?;
    writer.append(data)?;
    writer.finish()?;
    Ok(())
}

#[test]
fn test_element_writer_rejects_element_beyond_maximum() {
    let dir = TempDir::new().unwrap();
    let mut queue = create_queue(&dir);
    let buffer = vec![0u8; (MAX_SIZE / 4) as usize];

    let mut writer = queue.element_writer().unwrap();
    for _ in 0..3 {
        writer.append(&buffer).unwrap();
        writer.next().unwrap();
    }
    let err = writer.append(&buffer).unwrap_err();
    assert!(matches!(err, StorageError::QueueFull { .. }));
    assert_eq!(writer.pending_len(), 0);
    assert_eq!(writer.finish().unwrap(), 3);

    assert_eq!(queue.len(), 3);
}

#[test]
fn test_element_writer_circular() {
    let dir = TempDir::new().unwrap();
    let mut queue = create_queue(&dir);
    let buffer = vec![7u8; (MAX_SIZE / 4) as usize];

    let mut writer = queue.element_writer().unwrap();
    for _ in 0..3 {
        writer.append(&buffer).unwrap();
        writer.next().unwrap();
    }
    drop(writer);
    assert_eq!(queue.len(), 3);

    queue.remove(2).unwrap();
    assert_eq!(queue.len(), 1);

    let mut writer = queue.element_writer().unwrap();
    for _ in 0..2 {
        writer.append(&buffer).unwrap();
        writer.next().unwrap();
    }
    assert!(writer.append(&buffer).is_err());
    drop(writer);

    assert_eq!(queue.len(), 3);
    for reader in &queue {
        assert_eq!(reader.unwrap().read_all().unwrap(), buffer);
    }
}

#[test]
fn test_exact_size_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = queue_path(&dir);
    let mut buffer = vec![0u8; 244];
    rand::rng().fill_bytes(&mut buffer);

    {
        let mut queue = ElementQueue::open(&path, 40_000_000).unwrap();
        let mut writer = queue.element_writer().unwrap();
        for _ in 0..30 {
            writer.append(&buffer).unwrap();
            writer.next().unwrap();
        }
        writer.finish().unwrap();

        let mut writer = queue.element_writer().unwrap();
        for _ in 0..37 {
            writer.append(&buffer).unwrap();
            writer.next().unwrap();
        }
        writer.finish().unwrap();

        queue.remove(1).unwrap();
        write_element(&mut queue, &buffer).unwrap();
        queue.remove(66).unwrap();
        queue.close().unwrap();
    }

    let queue = ElementQueue::open(&path, 40_000_000).unwrap();
    assert_eq!(queue.file_size(), 32768);
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.peek().unwrap().unwrap().read_all().unwrap(), buffer);
}

#[test]
fn test_partial_read() {
    let dir = TempDir::new().unwrap();
    let mut queue = create_queue(&dir);

    let mut writer = queue.element_writer().unwrap();
    writer.write_all(&[1, 3]).unwrap();
    writer.next().unwrap();
    writer.write_all(&[4, 5]).unwrap();
    writer.finish().unwrap();

    let mut iter = queue.iter();
    let mut byte = [0u8; 1];
    iter.next().unwrap().unwrap().read_exact(&mut byte).unwrap();
    assert_eq!(byte[0], 1);
    iter.next().unwrap().unwrap().read_exact(&mut byte).unwrap();
    assert_eq!(byte[0], 4);
    assert!(iter.next().is_none());
}

#[test]
fn test_dropped_writer_leaves_queue_unchanged() {
    let dir = TempDir::new().unwrap();
    let mut queue = create_queue(&dir);
    write_element(&mut queue, b"committed").unwrap();
    let used = queue.used_bytes();

    {
        let mut writer = queue.element_writer().unwrap();
        writer.append(b"never committed").unwrap();
    }
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.used_bytes(), used);

    let before = std::fs::read(queue_path(&dir)).unwrap();
    {
        let mut writer = queue.element_writer().unwrap();
        writer.append(b"also dropped").unwrap();
    }
    assert_eq!(std::fs::read(queue_path(&dir)).unwrap(), before);
}

#[test]
fn test_is_empty() {
    let dir = TempDir::new().unwrap();
    let mut queue = create_queue(&dir);
    assert!(queue.is_empty());

    write_element(&mut queue, &[1]).unwrap();
    assert!(!queue.is_empty());
    assert_eq!(queue.len(), 1);

    assert!(queue.peek().unwrap().is_some());
    assert!(!queue.is_empty());
    assert_eq!(queue.len(), 1);

    queue.remove(1).unwrap();
    assert!(queue.is_empty());
    assert_eq!(queue.len(), 0);
}

#[test]
fn test_peek() {
    let dir = TempDir::new().unwrap();
    let mut queue = create_queue(&dir);
    assert!(queue.peek().unwrap().is_none());

    let mut rng = rand::rng();
    let v1: u8 = rng.random();
    let v2: u8 = rng.random();
    let mut buffer = [0u8; 16];
    rng.fill_bytes(&mut buffer);

    let mut writer = queue.element_writer().unwrap();
    writer.append(&[v1]).unwrap();
    writer.next().unwrap();
    writer.append(&[v2]).unwrap();
    writer.next().unwrap();
    writer.append(&buffer).unwrap();
    writer.finish().unwrap();
    assert_eq!(queue.len(), 3);

    for _ in 0..2 {
        let reader = queue.peek().unwrap().unwrap();
        assert_eq!(reader.len(), 1);
        assert_eq!(reader.read_all().unwrap(), vec![v1]);
    }

    queue.remove(1).unwrap();
    assert_eq!(queue.peek().unwrap().unwrap().read_all().unwrap(), vec![v2]);

    queue.remove(1).unwrap();
    let mut reader = queue.peek().unwrap().unwrap();
    assert_eq!(reader.len(), 16);
    let mut actual = [0u8; 20];
    assert_eq!(reader.read(&mut actual).unwrap(), 16);
    assert_eq!(&actual[..16], &buffer);
    assert_eq!(reader.read(&mut actual).unwrap(), 0);

    queue.remove(1).unwrap();
    assert!(queue.peek().unwrap().is_none());
}

#[test]
fn test_iterator_is_finite_and_restartable() {
    let dir = TempDir::new().unwrap();
    let mut queue = create_queue(&dir);

    let mut writer = queue.element_writer().unwrap();
    writer.append(&[1]).unwrap();
    writer.next().unwrap();
    writer.append(&[2]).unwrap();
    writer.finish().unwrap();

    let mut iter = queue.iter();
    assert_eq!(iter.size_hint(), (2, Some(2)));
    assert_eq!(iter.next().unwrap().unwrap().read_all().unwrap(), vec![1]);
    assert_eq!(iter.next().unwrap().unwrap().read_all().unwrap(), vec![2]);
    assert!(iter.next().is_none());
    assert!(iter.next().is_none());

    let all: Vec<Vec<u8>> = queue
        .iter()
        .map(|reader| reader.unwrap().read_all().unwrap())
        .collect();
    assert_eq!(all, vec![vec![1], vec![2]]);
}

#[test]
fn test_remove_more_than_available() {
    let dir = TempDir::new().unwrap();
    let mut queue = create_queue(&dir);
    write_element(&mut queue, &[1]).unwrap();

    let err = queue.remove(2).unwrap_err();
    assert!(matches!(
        err,
        StorageError::NoSuchElement {
            requested: 2,
            available: 1
        }
    ));
    assert_eq!(queue.len(), 1);
    queue.remove(0).unwrap();
    assert_eq!(queue.len(), 1);
}

#[test]
fn test_clear() {
    let dir = TempDir::new().unwrap();
    let mut queue = create_queue(&dir);
    let buffer = vec![1u8; 3000];

    let mut writer = queue.element_writer().unwrap();
    for _ in 0..4 {
        writer.append(&buffer).unwrap();
        writer.next().unwrap();
    }
    writer.finish().unwrap();
    assert_eq!(queue.len(), 4);
    assert_eq!(queue.file_size(), 4 * MINIMUM_LENGTH);

    queue.clear().unwrap();
    assert!(queue.is_empty());
    assert_eq!(queue.used_bytes(), QUEUE_HEADER_LENGTH);
    assert_eq!(queue.file_size(), MINIMUM_LENGTH);
    assert_eq!(
        std::fs::metadata(queue_path(&dir)).unwrap().len(),
        MINIMUM_LENGTH
    );
}

fn write_assert_file_size(
    expected_size: u64,
    expected_used: u64,
    buffer: &[u8],
    queue: &mut ElementQueue,
) -> Result<(), StorageError> {
    write_element(queue, buffer)?;
    assert_eq!(queue.used_bytes(), expected_used);
    assert_eq!(queue.file_size(), expected_size);
    Ok(())
}

#[test]
fn test_file_size() {
    let dir = TempDir::new().unwrap();
    let mut queue = create_queue(&dir);
    assert_eq!(queue.file_size(), MINIMUM_LENGTH);

    let buf_size = MAX_SIZE / 16 - QUEUE_HEADER_LENGTH;
    let buffer = vec![0u8; buf_size as usize];
    let element_size = buf_size + ELEMENT_HEADER_LENGTH;
    let expected_sizes = [1, 1, 2, 2, 4, 4, 4, 4, 8, 8, 8, 8, 8, 8, 8, 8];

    for (i, factor) in expected_sizes.iter().enumerate() {
        write_assert_file_size(
            MINIMUM_LENGTH * factor,
            element_size * (i as u64 + 1) + QUEUE_HEADER_LENGTH,
            &buffer,
            &mut queue,
        )
        .unwrap();
    }

    // queue is full now
    let err = write_assert_file_size(MAX_SIZE, 0, &buffer, &mut queue).unwrap_err();
    assert!(matches!(err, StorageError::QueueFull { .. }));
    assert_eq!(queue.len(), 16);

    // after removing elements, new ones are written circularly
    for _ in 0..3 {
        queue.remove(1).unwrap();
        write_assert_file_size(
            MAX_SIZE,
            element_size * 16 + QUEUE_HEADER_LENGTH,
            &buffer,
            &mut queue,
        )
        .unwrap();
    }

    queue.remove(14).unwrap();
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.used_bytes(), element_size * 2 + QUEUE_HEADER_LENGTH);
    assert_eq!(queue.file_size(), MINIMUM_LENGTH * 2);
}

#[test]
fn test_growth_keeps_wrapped_elements_readable() {
    let dir = TempDir::new().unwrap();
    let mut queue = create_queue(&dir);

    // fill the minimum file, free its head and wrap around the end
    let elements: Vec<Vec<u8>> = (0..7u8).map(|i| vec![i; 1000]).collect();
    for element in &elements[..4] {
        write_element(&mut queue, element).unwrap();
    }
    assert_eq!(queue.file_size(), MINIMUM_LENGTH);
    queue.remove(2).unwrap();
    write_element(&mut queue, &elements[4]).unwrap();
    write_element(&mut queue, &elements[5]).unwrap();
    assert_eq!(queue.file_size(), MINIMUM_LENGTH);

    // this one no longer fits and forces growth while wrapped
    write_element(&mut queue, &elements[6]).unwrap();
    assert_eq!(queue.file_size(), 2 * MINIMUM_LENGTH);
    assert_eq!(queue.len(), 5);
    assert_eq!(
        queue.used_bytes(),
        QUEUE_HEADER_LENGTH + 5 * (1000 + ELEMENT_HEADER_LENGTH)
    );

    let actual: Vec<Vec<u8>> = queue
        .iter()
        .map(|reader| reader.unwrap().read_all().unwrap())
        .collect();
    assert_eq!(actual, elements[2..].to_vec());
}

#[test]
fn test_reopen_preserves_elements() {
    let dir = TempDir::new().unwrap();
    let path = queue_path(&dir);
    {
        let mut queue = ElementQueue::open(&path, MAX_SIZE).unwrap();
        write_element(&mut queue, b"first").unwrap();
        write_element(&mut queue, b"second").unwrap();
        queue.close().unwrap();
    }

    let mut queue = ElementQueue::open(&path, MAX_SIZE).unwrap();
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.peek().unwrap().unwrap().read_all().unwrap(), b"first");
    queue.remove(1).unwrap();
    write_element(&mut queue, b"third").unwrap();

    let actual: Vec<Vec<u8>> = queue
        .iter()
        .map(|reader| reader.unwrap().read_all().unwrap())
        .collect();
    assert_eq!(actual, vec![b"second".to_vec(), b"third".to_vec()]);
}

#[test]
fn test_corrupt_header_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = queue_path(&dir);
    {
        let mut queue = ElementQueue::open(&path, MAX_SIZE).unwrap();
        write_element(&mut queue, b"data").unwrap();
    }
    let mut data = std::fs::read(&path).unwrap();
    data[20] ^= 0xff;
    std::fs::write(&path, &data).unwrap();

    let err = ElementQueue::open(&path, MAX_SIZE).unwrap_err();
    assert!(matches!(err, StorageError::Corrupt { .. }));
}

#[test]
fn test_corrupt_element_closes_queue() {
    let dir = TempDir::new().unwrap();
    let path = queue_path(&dir);
    let mut queue = ElementQueue::open(&path, MAX_SIZE).unwrap();
    write_element(&mut queue, b"one").unwrap();
    write_element(&mut queue, b"two").unwrap();
    write_element(&mut queue, b"three").unwrap();

    // overwrite the checksum byte of the second element header
    let second = QUEUE_HEADER_LENGTH + ELEMENT_HEADER_LENGTH + 3;
    let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    use std::io::{Seek, SeekFrom};
    file.seek(SeekFrom::Start(second + 4)).unwrap();
    file.write_all(&[0x5a]).unwrap();
    file.sync_all().unwrap();
    drop(file);

    let results: Vec<_> = queue.iter().collect();
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(StorageError::Corrupt { .. })));
    assert_eq!(results.len(), 2);
    drop(results);

    assert!(queue.is_closed());
    assert!(matches!(queue.remove(1), Err(StorageError::Closed)));
    assert!(matches!(queue.element_writer(), Err(StorageError::Closed)));
}

#[test]
fn test_interrupted_growth_is_truncated_on_open() {
    let dir = TempDir::new().unwrap();
    let path = queue_path(&dir);
    {
        let mut queue = ElementQueue::open(&path, MAX_SIZE).unwrap();
        write_element(&mut queue, b"data").unwrap();
    }
    // the file was extended but the header was never committed
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(2 * MINIMUM_LENGTH).unwrap();
    drop(file);

    let queue = ElementQueue::open(&path, MAX_SIZE).unwrap();
    assert_eq!(queue.file_size(), MINIMUM_LENGTH);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), MINIMUM_LENGTH);
    assert_eq!(queue.peek().unwrap().unwrap().read_all().unwrap(), b"data");
}

#[test]
fn test_maximum_file_size_can_be_changed() {
    let dir = TempDir::new().unwrap();
    let mut queue = create_queue(&dir);
    assert_eq!(queue.maximum_file_size(), MAX_SIZE);

    queue.set_maximum_file_size(MINIMUM_LENGTH).unwrap();
    assert_eq!(queue.maximum_file_size(), MINIMUM_LENGTH);
    let err = write_element(&mut queue, &vec![0u8; 5000]).unwrap_err();
    assert!(matches!(err, StorageError::QueueFull { .. }));

    queue.set_maximum_file_size(3 * MINIMUM_LENGTH).unwrap();
    assert_eq!(queue.maximum_file_size(), 2 * MINIMUM_LENGTH);
    write_element(&mut queue, &vec![0u8; 5000]).unwrap();
    assert_eq!(queue.file_size(), 2 * MINIMUM_LENGTH);
}

#[derive(Debug, Clone, Copy)]
enum Operation {
    Reopen,
    Clear,
    Remove,
    Read,
    Write,
}

fn payload(id: u64, length: usize) -> Vec<u8> {
    (0..length).map(|i| ((id + i as u64) % 251) as u8).collect()
}

#[test]
fn test_endurance() {
    let dir = TempDir::new().unwrap();
    let path = queue_path(&dir);
    let size = MINIMUM_LENGTH * 4;
    let max_element = (size * 2 / 3) as usize;
    let mut rng = StdRng::seed_from_u64(0x5eed);

    let mut queue = ElementQueue::open(&path, size).unwrap();
    let mut model: VecDeque<(u64, usize)> = VecDeque::new();
    let mut next_id = 0u64;

    for _ in 0..1_000 {
        let roll: f64 = rng.random();
        let operation = match roll {
            r if r < 0.05 => Operation::Reopen,
            r if r < 0.1 => Operation::Clear,
            r if r < 0.4 && !model.is_empty() => Operation::Remove,
            r if r < 0.7 && !model.is_empty() => Operation::Read,
            _ => Operation::Write,
        };

        match operation {
            Operation::Reopen => {
                queue.close().unwrap();
                queue = ElementQueue::open(&path, size).unwrap();
            }
            Operation::Clear => {
                queue.clear().unwrap();
                model.clear();
            }
            Operation::Remove => {
                let n = rng.random_range(1..=model.len());
                queue.remove(n).unwrap();
                model.drain(..n);
            }
            Operation::Read => {
                let n = rng.random_range(1..=model.len());
                for (reader, (id, length)) in queue.iter().zip(model.iter()).take(n) {
                    let data = reader.unwrap().read_all().unwrap();
                    assert_eq!(data, payload(*id, *length));
                }
            }
            Operation::Write => {
                let count = rng.random_range(1..=16);
                let mut writer = queue.element_writer().unwrap();
                for _ in 0..count {
                    let length = if rng.random_bool(0.8) {
                        rng.random_range(1..=256)
                    } else {
                        rng.random_range(1..=max_element)
                    };
                    let data = payload(next_id, length);
                    match writer.append(&data) {
                        Ok(()) => {
                            writer.next().unwrap();
                            model.push_back((next_id, length));
                            next_id += 1;
                        }
                        Err(StorageError::QueueFull { .. }) => {}
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
                writer.finish().unwrap();
            }
        }

        let expected_used = QUEUE_HEADER_LENGTH
            + model
                .iter()
                .map(|(_, length)| *length as u64 + ELEMENT_HEADER_LENGTH)
                .sum::<u64>();
        assert_eq!(queue.len(), model.len(), "size after {operation:?}");
        assert_eq!(queue.used_bytes(), expected_used, "used bytes after {operation:?}");
        assert!(queue.file_size() <= size);
    }
}
